use crate::io::json::{json_read_file, json_read_str, json_write_file, json_write_str, JsonPretty};
use crate::make_error;
use crate::model::model_family::{ModelFamily, SubstitutionModel};
use crate::model::rate_matrix::FREQS_SUM_TOLERANCE;
use crate::params::bounds::{Bounds, FREQ_FLOOR};
use crate::tree::tree::Tree;
use crate::utils::error::LikelihoodError;
use eyre::{Report, WrapErr};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::Path;
use strum_macros::Display;

pub const LENGTH: &str = "length";
pub const FREQS: &str = "freqs";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
  Length,
  Rate,
  Freqs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
  Scalar(f64),
  Simplex(Vec<f64>),
}

impl ParamValue {
  pub const fn as_scalar(&self) -> Option<f64> {
    match self {
      Self::Scalar(x) => Some(*x),
      Self::Simplex(_) => None,
    }
  }

  pub fn as_simplex(&self) -> Option<&[f64]> {
    match self {
      Self::Scalar(_) => None,
      Self::Simplex(v) => Some(v),
    }
  }

  /// Number of degrees of freedom: a simplex of K components has K - 1
  pub fn n_free(&self) -> usize {
    match self {
      Self::Scalar(_) => 1,
      Self::Simplex(v) => v.len().saturating_sub(1),
    }
  }
}

impl Display for ParamValue {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Scalar(x) => write!(f, "{x}"),
      Self::Simplex(v) => write!(f, "[{}]", v.iter().join(", ")),
    }
  }
}

/// Set of edges sharing one value of a parameter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
  pub edges: Vec<String>,
  /// Whether the group also covers the root pseudo-edge
  pub includes_root: bool,
  pub value: ParamValue,
  pub bounds: Bounds,
  pub is_constant: bool,
}

impl ParamGroup {
  pub fn applies_to(&self, edge: &str) -> bool {
    self.edges.iter().any(|e| e == edge)
  }

  pub fn is_empty(&self) -> bool {
    self.edges.is_empty() && !self.includes_root
  }

  pub fn n_free(&self) -> usize {
    if self.is_constant {
      0
    } else {
      self.value.n_free()
    }
  }

  /// Short description of the scope, for messages
  pub fn scope(&self) -> String {
    let root = if self.includes_root { Some("root".to_owned()) } else { None };
    match (self.edges.as_slice(), root) {
      ([], Some(root)) => root,
      ([edge], None) => format!("edge '{edge}'"),
      (edges, root) => {
        let n = edges.len();
        let root = root.map(|_| " and root").unwrap_or_default();
        format!("{n} edges{root}")
      }
    }
  }

  /// Name of an edge to blame in errors
  fn blame(&self) -> &str {
    self.edges.first().map_or("root", String::as_str)
  }
}

/// A named model parameter, partitioned into groups of edges which share a value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
  pub name: String,
  pub kind: ParamKind,
  pub groups: Vec<ParamGroup>,
}

impl Parameter {
  /// Index of the group containing the edge
  pub fn group_of(&self, edge: &str) -> Option<usize> {
    self.groups.iter().position(|group| group.applies_to(edge))
  }

  /// Index of the group containing the root pseudo-edge
  pub fn root_group(&self) -> Option<usize> {
    self.groups.iter().position(|group| group.includes_root)
  }

  pub fn n_free(&self) -> usize {
    self.groups.iter().map(ParamGroup::n_free).sum()
  }
}

/// Reference to one group of one parameter
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupRef {
  pub param: String,
  pub group: usize,
}

/// All parameters of a model on a tree: edge lengths, rate parameters of the model family and equilibrium
/// frequencies, each with its binding of edges into groups, its bounds and whether it is held constant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
  family: ModelFamily,
  n_states: usize,
  edges: Vec<String>,
  params: IndexMap<String, Parameter>,
}

impl ParameterSet {
  /// Default parameters: one length per edge (taken from the tree), rate parameters and frequencies shared by all
  /// edges. Frequencies, when free, start uniform and also cover the root.
  pub fn new(model: &SubstitutionModel, tree: &Tree) -> Self {
    let edges = tree.edge_names().into_iter().map(str::to_owned).collect_vec();
    let mut params = IndexMap::new();

    let length_groups = tree
      .edges()
      .into_iter()
      .map(|id| ParamGroup {
        edges: vec![tree.name(id).to_owned()],
        includes_root: false,
        value: ParamValue::Scalar(tree.length(id)),
        bounds: Bounds::length(),
        is_constant: false,
      })
      .collect_vec();
    params.insert(
      LENGTH.to_owned(),
      Parameter {
        name: LENGTH.to_owned(),
        kind: ParamKind::Length,
        groups: length_groups,
      },
    );

    for spec in model.rate_params() {
      params.insert(
        spec.name.clone(),
        Parameter {
          name: spec.name,
          kind: ParamKind::Rate,
          groups: vec![ParamGroup {
            edges: edges.clone(),
            includes_root: spec.includes_root,
            value: ParamValue::Scalar(spec.bounds.clamp(spec.init)),
            bounds: spec.bounds,
            is_constant: false,
          }],
        },
      );
    }

    if model.has_free_freqs() {
      params.insert(
        FREQS.to_owned(),
        Parameter {
          name: FREQS.to_owned(),
          kind: ParamKind::Freqs,
          groups: vec![ParamGroup {
            edges: edges.clone(),
            includes_root: true,
            value: ParamValue::Simplex(model.uniform_freqs().to_vec()),
            bounds: Bounds::unit(),
            is_constant: false,
          }],
        },
      );
    }

    Self {
      family: model.family(),
      n_states: model.n_states(),
      edges,
      params,
    }
  }

  pub const fn family(&self) -> ModelFamily {
    self.family
  }

  pub const fn n_states(&self) -> usize {
    self.n_states
  }

  pub fn edges(&self) -> &[String] {
    &self.edges
  }

  pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
    self.params.keys().map(String::as_str)
  }

  pub fn params(&self) -> impl Iterator<Item = &Parameter> + '_ {
    self.params.values()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.params.contains_key(name)
  }

  pub fn param(&self, name: &str) -> Result<&Parameter, Report> {
    self.params.get(name).ok_or_else(|| self.unknown_param(name))
  }

  pub(crate) fn param_mut(&mut self, name: &str) -> Result<&mut Parameter, Report> {
    if !self.params.contains_key(name) {
      return Err(self.unknown_param(name));
    }
    self
      .params
      .get_mut(name)
      .ok_or_else(|| LikelihoodError::invalid_parameter(name, "no such parameter").into())
  }

  fn unknown_param(&self, name: &str) -> Report {
    LikelihoodError::invalid_parameter(
      name,
      format!("no such parameter. Known parameters: {}", self.names().join(", ")),
    )
    .into()
  }

  fn check_edge(&self, edge: &str) -> Result<(), Report> {
    if self.edges.iter().any(|e| e == edge) {
      Ok(())
    } else {
      make_error!("Edge '{edge}' is not in the tree")
    }
  }

  /// Value of a parameter on an edge
  pub fn value(&self, name: &str, edge: &str) -> Result<&ParamValue, Report> {
    self.check_edge(edge)?;
    let param = self.param(name)?;
    let group = param
      .group_of(edge)
      .ok_or_else(|| LikelihoodError::invalid_parameter(name, "no value for this edge").on_edge(edge))?;
    Ok(&param.groups[group].value)
  }

  /// Value of a parameter on the root pseudo-edge, if the parameter covers the root
  pub fn root_value(&self, name: &str) -> Option<&ParamValue> {
    let param = self.params.get(name)?;
    param.root_group().map(|group| &param.groups[group].value)
  }

  pub fn scalar(&self, name: &str, edge: &str) -> Result<f64, Report> {
    self
      .value(name, edge)?
      .as_scalar()
      .ok_or_else(|| LikelihoodError::invalid_parameter(name, "is not a scalar parameter").into())
  }

  pub fn length(&self, edge: &str) -> Result<f64, Report> {
    self.scalar(LENGTH, edge)
  }

  pub fn group_value(&self, name: &str, group: usize) -> Result<&ParamValue, Report> {
    let param = self.param(name)?;
    match param.groups.get(group) {
      Some(group) => Ok(&group.value),
      None => make_error!("Parameter '{name}' has no group {group}"),
    }
  }

  pub fn group(&self, gref: &GroupRef) -> Result<&ParamGroup, Report> {
    let param = self.param(&gref.param)?;
    match param.groups.get(gref.group) {
      Some(group) => Ok(group),
      None => make_error!("Parameter '{}' has no group {}", gref.param, gref.group),
    }
  }

  /// Sets the value of one group, checking kind and bounds
  pub fn set_group_value(&mut self, name: &str, group: usize, value: ParamValue) -> Result<(), Report> {
    let n_states = self.n_states;
    let param = self.param_mut(name)?;
    let kind = param.kind;
    let Some(group) = param.groups.get_mut(group) else {
      return make_error!("Parameter '{name}' has no group {group}");
    };
    validate_value(name, kind, &value, &group.bounds, n_states).map_err(|err| err.on_edge(group.blame()))?;
    group.value = value;
    Ok(())
  }

  /// Sets the value of the group containing the edge. Other edges of the same group change too.
  pub fn set_value(&mut self, name: &str, edge: &str, value: ParamValue) -> Result<(), Report> {
    self.check_edge(edge)?;
    let group = self
      .param(name)?
      .group_of(edge)
      .ok_or_else(|| LikelihoodError::invalid_parameter(name, "no value for this edge").on_edge(edge))?;
    self.set_group_value(name, group, value)
  }

  pub fn set_length(&mut self, edge: &str, length: f64) -> Result<(), Report> {
    self.set_value(LENGTH, edge, ParamValue::Scalar(length))
  }

  /// Sets every group of a parameter to the same value, e.g. empirical frequencies
  pub fn set_all(&mut self, name: &str, value: &ParamValue) -> Result<(), Report> {
    let n_groups = self.param(name)?.groups.len();
    for group in 0..n_groups {
      self.set_group_value(name, group, value.clone())?;
    }
    Ok(())
  }

  /// Number of free parameters: one per non-constant scalar group and K - 1 per non-constant frequency group
  pub fn n_free_params(&self) -> usize {
    self.params.values().map(Parameter::n_free).sum()
  }

  /// Groups which are not constant, in parameter order
  pub fn free_groups(&self) -> Vec<GroupRef> {
    self
      .params
      .values()
      .flat_map(|param| {
        param
          .groups
          .iter()
          .enumerate()
          .filter(|(_, group)| !group.is_constant)
          .map(|(group, _)| GroupRef {
            param: param.name.clone(),
            group,
          })
      })
      .collect()
  }

  /// Flat vector of the values of all free groups, in the order of `free_groups()`
  pub fn free_values(&self) -> Vec<f64> {
    self
      .params
      .values()
      .flat_map(|param| param.groups.iter().filter(|group| !group.is_constant))
      .flat_map(|group| match &group.value {
        ParamValue::Scalar(x) => vec![*x],
        ParamValue::Simplex(v) => v.clone(),
      })
      .collect()
  }

  /// Inverse of `free_values()`
  pub fn set_free_values(&mut self, values: &[f64]) -> Result<(), Report> {
    let mut offset = 0;
    for gref in self.free_groups() {
      let current = self.group_value(&gref.param, gref.group)?;
      let n = match current {
        ParamValue::Scalar(_) => 1,
        ParamValue::Simplex(v) => v.len(),
      };
      let Some(chunk) = values.get(offset..offset + n) else {
        return make_error!(
          "Expected at least {} free values, but found {}",
          offset + n,
          values.len()
        );
      };
      let value = match current {
        ParamValue::Scalar(_) => ParamValue::Scalar(chunk[0]),
        ParamValue::Simplex(_) => ParamValue::Simplex(chunk.to_vec()),
      };
      self.set_group_value(&gref.param, gref.group, value)?;
      offset += n;
    }
    if offset != values.len() {
      return make_error!("Expected {offset} free values, but found {}", values.len());
    }
    Ok(())
  }

  /// Moves every value into its feasible region: scalars are clamped into their bounds, frequencies are projected
  /// onto the simplex with a small floor.
  pub fn project(&mut self) {
    for param in self.params.values_mut() {
      for group in &mut param.groups {
        group.value = match &group.value {
          ParamValue::Scalar(x) => ParamValue::Scalar(group.bounds.clamp(*x)),
          ParamValue::Simplex(v) => ParamValue::Simplex(project_simplex(v)),
        };
      }
    }
  }

  pub(crate) fn insert_groups(&mut self, name: &str, groups: Vec<ParamGroup>) -> Result<(), Report> {
    let param = self.param_mut(name)?;
    param.groups = groups;
    Ok(())
  }

  pub fn to_json(&self) -> Result<String, Report> {
    json_write_str(self, JsonPretty(true)).wrap_err("When serializing parameter set")
  }

  pub fn from_json(s: impl AsRef<str>) -> Result<Self, Report> {
    json_read_str(s).wrap_err("When deserializing parameter set")
  }

  pub fn save_json(&self, filepath: impl AsRef<Path>) -> Result<(), Report> {
    json_write_file(filepath, self, JsonPretty(true)).wrap_err("When saving parameter set")
  }

  pub fn load_json(filepath: impl AsRef<Path>) -> Result<Self, Report> {
    json_read_file(filepath).wrap_err("When loading parameter set")
  }
}

impl Display for ParameterSet {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    for param in self.params.values() {
      for group in &param.groups {
        let constant = if group.is_constant { " (constant)" } else { "" };
        writeln!(f, "{} [{}]: {}{constant}", param.name, group.scope(), group.value)?;
      }
    }
    Ok(())
  }
}

/// Bounds of lengths and rates must be finite and non-negative, bounds of frequencies must lie within `[0, 1]`
pub(crate) fn validate_bounds(name: &str, kind: ParamKind, bounds: &Bounds) -> Result<(), LikelihoodError> {
  let admissible = match kind {
    ParamKind::Length | ParamKind::Rate => Bounds::new(0.0, f64::MAX)?,
    ParamKind::Freqs => Bounds::unit(),
  };
  if !(admissible.contains(bounds.lower) && admissible.contains(bounds.upper)) {
    return Err(LikelihoodError::invalid_parameter(
      name,
      format!(
        "bounds [{}, {}] of a {kind} parameter must lie within [{}, {}]",
        bounds.lower, bounds.upper, admissible.lower, admissible.upper
      ),
    ));
  }
  Ok(())
}

pub(crate) fn validate_value(
  name: &str,
  kind: ParamKind,
  value: &ParamValue,
  bounds: &Bounds,
  n_states: usize,
) -> Result<(), LikelihoodError> {
  match (kind, value) {
    (ParamKind::Length | ParamKind::Rate, ParamValue::Scalar(x)) => {
      if !x.is_finite() || !bounds.contains(*x) {
        return Err(LikelihoodError::invalid_parameter(
          name,
          format!("value {x} is outside of bounds [{}, {}]", bounds.lower, bounds.upper),
        ));
      }
      Ok(())
    }
    (ParamKind::Freqs, ParamValue::Simplex(v)) => {
      if v.len() != n_states {
        return Err(LikelihoodError::invalid_parameter(
          name,
          format!("expected {n_states} frequencies, but found {}", v.len()),
        ));
      }
      if let Some((i, x)) = v.iter().find_position(|x| !x.is_finite() || **x < 0.0) {
        return Err(LikelihoodError::invalid_parameter(
          name,
          format!("frequency {i} must be finite and non-negative, but found {x}"),
        ));
      }
      let sum: f64 = v.iter().sum();
      if (sum - 1.0).abs() > FREQS_SUM_TOLERANCE {
        return Err(LikelihoodError::invalid_parameter(
          name,
          format!("frequencies must sum to 1, but sum to {sum}"),
        ));
      }
      Ok(())
    }
    (kind, value) => Err(LikelihoodError::invalid_parameter(
      name,
      format!("value {value} does not fit parameter kind '{kind}'"),
    )),
  }
}

/// Projection onto the probability simplex: non-finite entries are replaced, every entry is raised to at least
/// `FREQ_FLOOR`, and the vector is renormalized
pub fn project_simplex(v: &[f64]) -> Vec<f64> {
  if v.is_empty() {
    return vec![];
  }
  let floored = v
    .iter()
    .map(|&x| if x.is_finite() { x.max(FREQ_FLOOR) } else { FREQ_FLOOR })
    .collect_vec();
  let sum: f64 = floored.iter().sum();
  floored.into_iter().map(|x| x / sum).collect()
}

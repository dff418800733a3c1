use crate::make_error;
use crate::params::bounds::Bounds;
use crate::params::parameter_set::{validate_bounds, validate_value, ParamGroup, ParamKind, ParamValue, ParameterSet};
use crate::tree::tree::Tree;
use eyre::{Report, WrapErr};
use indexmap::IndexSet;
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};

/// Rebinding of a parameter over a selection of edges.
///
/// The selection is the union of `edges` and of the edges below `clade`, or all edges plus the root when neither is
/// given. The selected edges leave their current groups. With `is_independent` each of them gets its own group,
/// otherwise they all share one new group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamRule {
  pub param: String,
  pub edges: Option<Vec<String>>,
  /// Name of a node. Selects the edge above it (unless it is the root) and every edge below it.
  pub clade: Option<String>,
  /// Whether the root pseudo-edge is selected. Implied when neither `edges` nor `clade` is given.
  pub root: bool,
  pub is_independent: bool,
  /// Value of the new group(s). Defaults to the current value of each edge's former group.
  pub init: Option<ParamValue>,
  pub bounds: Option<Bounds>,
  pub is_constant: bool,
}

impl ParamRule {
  pub fn new(param: impl AsRef<str>) -> Self {
    Self {
      param: param.as_ref().to_owned(),
      ..Self::default()
    }
  }

  #[must_use]
  pub fn edges(mut self, edges: &[impl AsRef<str>]) -> Self {
    self.edges = Some(edges.iter().map(|e| e.as_ref().to_owned()).collect());
    self
  }

  #[must_use]
  pub fn clade(mut self, name: impl AsRef<str>) -> Self {
    self.clade = Some(name.as_ref().to_owned());
    self
  }

  #[must_use]
  pub const fn root(mut self, root: bool) -> Self {
    self.root = root;
    self
  }

  #[must_use]
  pub const fn independent(mut self) -> Self {
    self.is_independent = true;
    self
  }

  #[must_use]
  pub fn init(mut self, value: ParamValue) -> Self {
    self.init = Some(value);
    self
  }

  #[must_use]
  pub const fn bounds(mut self, bounds: Bounds) -> Self {
    self.bounds = Some(bounds);
    self
  }

  #[must_use]
  pub const fn constant(mut self) -> Self {
    self.is_constant = true;
    self
  }
}

impl ParameterSet {
  /// Rebinds a parameter according to the rule. Fails without modifying the set when the rule names unknown
  /// parameters or edges, or gives an invalid value.
  pub fn apply_rule(&mut self, rule: &ParamRule, tree: &Tree) -> Result<(), Report> {
    let groups = self
      .rebind(rule, tree)
      .wrap_err_with(|| format!("When applying rule to parameter '{}'", rule.param))?;
    self.insert_groups(&rule.param, groups)
  }

  fn rebind(&self, rule: &ParamRule, tree: &Tree) -> Result<Vec<ParamGroup>, Report> {
    let param = self.param(&rule.param)?;
    let (edges, root) = self.select(rule, tree)?;

    if root && param.root_group().is_none() {
      return make_error!("Parameter '{}' does not apply to the root", rule.param);
    }
    if param.kind == ParamKind::Length && !rule.is_independent && edges.len() > 1 && rule.init.is_none() {
      debug!(
        "Binding lengths of {} edges into one group, starting from the length of '{}'",
        edges.len(),
        edges[0]
      );
    }

    // Former group of every selected edge, and of the root
    let former = |edge: &str| param.group_of(edge).map(|group| &param.groups[group]);
    let root_former = param.root_group().map(|group| &param.groups[group]);

    let make_group = |edges: Vec<String>, includes_root: bool, former: Option<&ParamGroup>| -> Result<_, Report> {
      let Some(former) = former else {
        return make_error!("Edge '{}' has no value of parameter '{}'", edges.join(", "), rule.param);
      };
      let bounds = rule.bounds.unwrap_or(former.bounds);
      validate_bounds(&rule.param, param.kind, &bounds)?;
      let value = match &rule.init {
        Some(init) => init.clone(),
        None => match &former.value {
          ParamValue::Scalar(x) => ParamValue::Scalar(bounds.clamp(*x)),
          simplex @ ParamValue::Simplex(_) => simplex.clone(),
        },
      };
      validate_value(&rule.param, param.kind, &value, &bounds, self.n_states())?;
      Ok(ParamGroup {
        edges,
        includes_root,
        value,
        bounds,
        is_constant: rule.is_constant,
      })
    };

    let new_groups = if rule.is_independent {
      let mut groups = edges
        .iter()
        .map(|edge| make_group(vec![edge.clone()], false, former(edge)))
        .collect::<Result<Vec<_>, Report>>()?;
      if root {
        groups.push(make_group(vec![], true, root_former)?);
      }
      groups
    } else {
      let first_former = edges.first().and_then(|edge| former(edge)).or(root_former);
      vec![make_group(edges.iter().cloned().collect(), root, first_former)?]
    };

    // Remaining parts of the former groups keep their value and position. The new groups take the position of the
    // first group they draw from.
    let mut result = Vec::with_capacity(param.groups.len() + new_groups.len());
    let mut new_groups = Some(new_groups);
    for group in &param.groups {
      let remaining_edges = group.edges.iter().filter(|e| !edges.contains(*e)).cloned().collect_vec();
      let remaining_root = group.includes_root && !root;
      let touched = remaining_edges.len() != group.edges.len() || remaining_root != group.includes_root;
      if touched {
        if let Some(new_groups) = new_groups.take() {
          result.extend(new_groups);
        }
      }
      let remaining = ParamGroup {
        edges: remaining_edges,
        includes_root: remaining_root,
        ..group.clone()
      };
      if !remaining.is_empty() {
        result.push(remaining);
      }
    }
    if let Some(new_groups) = new_groups {
      result.extend(new_groups);
    }
    Ok(result)
  }

  /// Edges selected by the rule, in tree order, and whether the root pseudo-edge is selected
  fn select(&self, rule: &ParamRule, tree: &Tree) -> Result<(IndexSet<String>, bool), Report> {
    if rule.edges.is_none() && rule.clade.is_none() {
      let root = rule.root || self.param(&rule.param)?.root_group().is_some();
      return Ok((self.edges().iter().cloned().collect(), root));
    }

    let mut selected = IndexSet::<String>::new();
    if let Some(edges) = &rule.edges {
      for edge in edges {
        if !self.edges().contains(edge) {
          return make_error!(
            "Edge '{edge}' is not in the tree. Known edges: {}",
            self.edges().iter().join(", ")
          );
        }
        selected.insert(edge.clone());
      }
    }
    if let Some(clade) = &rule.clade {
      for id in tree.clade_edges(clade)? {
        selected.insert(tree.name(id).to_owned());
      }
    }

    // Keep tree order, so that group contents do not depend on how the rule lists edges
    let ordered = self.edges().iter().filter(|e| selected.contains(*e)).cloned().collect();
    Ok((ordered, rule.root))
  }
}

use crate::{make_error, make_report};
use crate::model::model_family::SubstitutionModel;
use crate::model::rate_matrix::RateMatrix;
use crate::params::parameter_set::{ParamKind, ParamValue, ParameterSet, FREQS};
use crate::utils::error::{find_likelihood_error, LikelihoodError};
use eyre::{Report, WrapErr};
use indexmap::IndexMap;
use itertools::Itertools;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// One substitution process: the values of the rate parameters and frequencies shared by a set of edges, and the
/// resulting generator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Process {
  pub rates: IndexMap<String, f64>,
  pub freqs: Array1<f64>,
  pub rate_matrix: RateMatrix,
  pub edges: Vec<String>,
}

/// Mapping of every edge to the process acting on it, plus the root frequencies.
///
/// Edges whose rate and frequency parameters fall into the same groups share a process. A stationary, homogeneous
/// model has a single process whose frequencies equal the root frequencies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessAssignment {
  processes: Vec<Process>,
  edge_process: IndexMap<String, usize>,
  root_freqs: Array1<f64>,
}

impl ProcessAssignment {
  pub fn new(model: &SubstitutionModel, params: &ParameterSet) -> Result<Self, Report> {
    if params.family() != model.family() || params.n_states() != model.n_states() {
      return make_error!(
        "Parameters were created for model '{}' with {} states, but the model is '{}' with {} states",
        params.family(),
        params.n_states(),
        model.family(),
        model.n_states()
      );
    }

    let process_params = params.params().filter(|p| p.kind != ParamKind::Length).collect_vec();

    // Edges with the same tuple of group indices share a process
    let mut by_key = IndexMap::<Vec<usize>, Vec<String>>::new();
    for edge in params.edges() {
      let key = process_params
        .iter()
        .map(|param| {
          param
            .group_of(edge)
            .ok_or_else(|| make_report!("Edge '{edge}' has no value of parameter '{}'", param.name))
        })
        .collect::<Result<Vec<_>, Report>>()?;
      by_key.entry(key).or_default().push(edge.clone());
    }

    let mut processes = Vec::with_capacity(by_key.len());
    let mut edge_process = IndexMap::new();
    for (index, (key, edges)) in by_key.into_iter().enumerate() {
      let mut rates = IndexMap::new();
      let mut freqs = None;
      for (param, &group) in process_params.iter().zip(key.iter()) {
        match &param.groups[group].value {
          ParamValue::Scalar(x) => {
            rates.insert(param.name.clone(), *x);
          }
          ParamValue::Simplex(v) => freqs = Some(Array1::from(v.clone())),
        }
      }
      let rate_matrix = model
        .rate_matrix(&rates, freqs.as_ref())
        .wrap_err_with(|| format!("When building the process of edges {}", edges.iter().join(", ")))
        .map_err(|report| tag_first_edge(report, &edges))?;
      let freqs = rate_matrix.freqs().clone();
      for edge in &edges {
        edge_process.insert(edge.clone(), index);
      }
      processes.push(Process {
        rates,
        freqs,
        rate_matrix,
        edges,
      });
    }

    let root_freqs = Self::compute_root_freqs(model, params).wrap_err("When computing root frequencies")?;

    Ok(Self {
      processes,
      edge_process,
      root_freqs,
    })
  }

  fn compute_root_freqs(model: &SubstitutionModel, params: &ParameterSet) -> Result<Array1<f64>, Report> {
    let mut rates = IndexMap::new();
    let mut freqs = None;
    for param in params.params().filter(|p| p.kind != ParamKind::Length) {
      match (param.name.as_str(), params.root_value(&param.name)) {
        (FREQS, Some(ParamValue::Simplex(v))) => freqs = Some(Array1::from(v.clone())),
        (_, Some(ParamValue::Scalar(x))) => {
          rates.insert(param.name.clone(), *x);
        }
        _ => {}
      }
    }
    model.equilibrium_freqs(&rates, freqs.as_ref())
  }

  pub fn n_processes(&self) -> usize {
    self.processes.len()
  }

  pub fn processes(&self) -> &[Process] {
    &self.processes
  }

  pub fn process(&self, index: usize) -> Option<&Process> {
    self.processes.get(index)
  }

  /// Index of the process acting on an edge
  pub fn process_of(&self, edge: &str) -> Option<usize> {
    self.edge_process.get(edge).copied()
  }

  pub fn rate_matrix_of(&self, edge: &str) -> Result<&RateMatrix, Report> {
    match self.process_of(edge) {
      Some(index) => Ok(&self.processes[index].rate_matrix),
      None => make_error!("Edge '{edge}' has no process"),
    }
  }

  /// Edge name -> process index, in tree order
  pub fn edge_processes(&self) -> &IndexMap<String, usize> {
    &self.edge_process
  }

  pub const fn root_freqs(&self) -> &Array1<f64> {
    &self.root_freqs
  }

  /// Same process on every edge
  pub fn is_homogeneous(&self) -> bool {
    self.processes.len() <= 1
  }

  /// Homogeneous, with root frequencies equal to the equilibrium frequencies of the process
  pub fn is_stationary(&self) -> bool {
    self.is_homogeneous()
      && self.processes.iter().all(|process| {
        process
          .freqs
          .iter()
          .zip(self.root_freqs.iter())
          .all(|(a, b)| (a - b).abs() <= 1e-12)
      })
  }
}

/// Makes sure a `LikelihoodError` raised by the model names an edge of the process
fn tag_first_edge(report: Report, edges: &[String]) -> Report {
  let (Some(err), Some(edge)) = (find_likelihood_error(&report), edges.first()) else {
    return report;
  };
  let context = report
    .chain()
    .take_while(|cause| cause.downcast_ref::<LikelihoodError>().is_none())
    .map(ToString::to_string)
    .join(": ");
  let tagged = Report::new(err.clone().on_edge(edge));
  if context.is_empty() {
    tagged
  } else {
    tagged.wrap_err(context)
  }
}

impl Display for ProcessAssignment {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    writeln!(f, "Root frequencies: [{}]", self.root_freqs.iter().map(|x| format!("{x:.4}")).join(", "))?;
    for (index, process) in self.processes.iter().enumerate() {
      let rates = process.rates.iter().map(|(name, x)| format!("{name}={x:.4}")).join(", ");
      let freqs = process.freqs.iter().map(|x| format!("{x:.4}")).join(", ");
      writeln!(f, "Process {index}: {rates} freqs=[{freqs}]")?;
      writeln!(f, "  edges: {}", process.edges.join(", "))?;
    }
    Ok(())
  }
}

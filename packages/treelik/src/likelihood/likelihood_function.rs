use crate::alignment::alignment::Alignment;
use crate::alignment::patterns::Patterns;
use crate::likelihood::partials::Partial;
use crate::{make_error, make_internal_error, make_internal_report, make_report};
use crate::model::model_family::SubstitutionModel;
use crate::params::parameter_set::{project_simplex, ParamValue, ParameterSet, FREQS};
use crate::params::rule::ParamRule;
use crate::process::assignment::ProcessAssignment;
use crate::transition::provider::{CacheStats, TransitionOptions, TransitionProvider};
use crate::tree::tree::{NodeId, Tree};
use crate::utils::error::LikelihoodError;
use eyre::Report;
use itertools::Itertools;
use log::trace;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-edge quantities for display and downstream statistics
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeStats {
  pub edge: String,
  pub length: f64,
  pub process: usize,
  /// Expected number of substitutions along the edge: length times the expected rate of its process
  pub expected_substitutions: f64,
}

/// Log-likelihood of an alignment on a tree under a substitution model, for a mutable set of parameters.
///
/// Owns every cache involved: eigendecompositions, per-edge transition matrices and per-node partials. A parameter
/// change invalidates the transition matrix of each affected edge and the partials of that edge's ancestors, which
/// are recomputed on the next evaluation.
#[derive(Debug)]
pub struct LikelihoodFunction {
  model: SubstitutionModel,
  tree: Tree,
  patterns: Patterns,
  params: ParameterSet,
  assignment: ProcessAssignment,
  provider: TransitionProvider,
  /// Indexed by node. Tips hold their leaf partials, never recomputed. Internal nodes hold `None` when invalidated.
  partials: Vec<Option<Partial>>,
  /// Transition matrix of the edge above each node, `None` when invalidated or for the root
  transitions: Vec<Option<Array2<f64>>>,
  n_evaluations: usize,
}

impl LikelihoodFunction {
  pub fn new(model: SubstitutionModel, tree: Tree, aln: &Alignment) -> Result<Self, Report> {
    check_topology(&tree, aln.names())?;
    Self::with_patterns(model, tree, aln.patterns())
  }

  /// Likelihood of explicitly weighted patterns, e.g. expected pattern frequencies
  pub fn with_patterns(model: SubstitutionModel, tree: Tree, patterns: Patterns) -> Result<Self, Report> {
    Self::with_options(model, tree, patterns, TransitionOptions::default())
  }

  pub fn with_options(
    model: SubstitutionModel,
    tree: Tree,
    patterns: Patterns,
    options: TransitionOptions,
  ) -> Result<Self, Report> {
    check_topology(&tree, patterns.names().iter().map(String::as_str))?;

    let mut partials = vec![None; tree.len()];
    for id in tree.tips() {
      let name = tree.name(id);
      let Some(profile) = patterns.leaf_profile(name) else {
        return make_error!("No data for tip '{name}'");
      };
      if profile.ncols() != model.n_states() {
        return make_error!(
          "Data of tip '{name}' has {} states per site, but the model has {} states",
          profile.ncols(),
          model.n_states()
        );
      }
      partials[id.0] = Some(Partial::leaf(profile));
    }

    let params = ParameterSet::new(&model, &tree);
    let assignment = ProcessAssignment::new(&model, &params)?;

    Ok(Self {
      transitions: vec![None; tree.len()],
      partials,
      model,
      tree,
      patterns,
      params,
      assignment,
      provider: TransitionProvider::new(options),
      n_evaluations: 0,
    })
  }

  pub const fn model(&self) -> &SubstitutionModel {
    &self.model
  }

  pub const fn tree(&self) -> &Tree {
    &self.tree
  }

  pub const fn patterns(&self) -> &Patterns {
    &self.patterns
  }

  pub const fn params(&self) -> &ParameterSet {
    &self.params
  }

  pub const fn process_assignment(&self) -> &ProcessAssignment {
    &self.assignment
  }

  /// Number of completed log-likelihood evaluations
  pub const fn n_evaluations(&self) -> usize {
    self.n_evaluations
  }

  pub fn cache_stats(&self) -> CacheStats {
    self.provider.stats()
  }

  /// Replaces all parameters. Fails, leaving the function unchanged, when the parameters belong to another model
  /// or tree or do not yield valid processes.
  pub fn set_params(&mut self, params: ParameterSet) -> Result<(), Report> {
    if params.edges() != self.params.edges() {
      return make_error!(
        "Parameters were created for a tree with edges [{}], but this tree has edges [{}]",
        params.edges().join(", "),
        self.params.edges().join(", ")
      );
    }
    let assignment = ProcessAssignment::new(&self.model, &params)?;

    for id in self.tree.edges() {
      let edge = self.tree.name(id);
      let length_changed = params.length(edge)?.to_bits() != self.params.length(edge)?.to_bits();
      let process_changed =
        assignment.rate_matrix_of(edge)?.key() != self.assignment.rate_matrix_of(edge)?.key();
      if length_changed || process_changed {
        self.invalidate_edge(id);
      }
    }

    self.params = params;
    self.assignment = assignment;
    Ok(())
  }

  /// Sets one parameter value on an edge (and on every edge sharing its group)
  pub fn set_value(&mut self, name: &str, edge: &str, value: ParamValue) -> Result<(), Report> {
    let mut params = self.params.clone();
    params.set_value(name, edge, value)?;
    self.set_params(params)
  }

  pub fn set_group_value(&mut self, name: &str, group: usize, value: ParamValue) -> Result<(), Report> {
    let mut params = self.params.clone();
    params.set_group_value(name, group, value)?;
    self.set_params(params)
  }

  pub fn apply_rule(&mut self, rule: &ParamRule) -> Result<(), Report> {
    let mut params = self.params.clone();
    params.apply_rule(rule, &self.tree)?;
    self.set_params(params)
  }

  /// Sets all frequency groups to the empirical state frequencies of the data, floored away from zero
  pub fn use_empirical_freqs(&mut self, aln: &Alignment) -> Result<(), Report> {
    if !self.model.has_free_freqs() {
      return Ok(());
    }
    let freqs = project_simplex(&aln.empirical_freqs().to_vec());
    let mut params = self.params.clone();
    params.set_all(FREQS, &ParamValue::Simplex(freqs))?;
    self.set_params(params)
  }

  /// Drops the transition matrix of the edge above `id` and the partials of all ancestors of `id`
  fn invalidate_edge(&mut self, id: NodeId) {
    self.transitions[id.0] = None;
    for ancestor in self.tree.ancestors(id) {
      self.partials[ancestor.0] = None;
    }
  }

  /// Drops every cache except the leaf partials
  pub fn invalidate_all(&mut self) {
    for id in self.tree.edges() {
      self.invalidate_edge(id);
    }
    self.provider.clear();
  }

  /// Recomputes the invalidated transition matrices. Eigendecompositions are prepared sequentially; transition
  /// matrices of different edges are independent and are computed in parallel.
  fn update_transitions(&mut self) -> Result<(), Report> {
    let stale = self
      .tree
      .edges()
      .into_iter()
      .filter(|id| self.transitions[id.0].is_none())
      .collect_vec();
    if stale.is_empty() {
      return Ok(());
    }

    for process in self.assignment.processes() {
      self.provider.prepare(&process.rate_matrix);
    }
    let current = self.assignment.processes().iter().map(|process| process.rate_matrix.key()).collect_vec();
    self.provider.retain(&current);

    let (tree, params, assignment, provider) = (&self.tree, &self.params, &self.assignment, &self.provider);
    let computed = stale
      .par_iter()
      .map(|&id| -> Result<Array2<f64>, Report> {
        let edge = tree.name(id);
        let length = params.length(edge)?;
        let q = assignment.rate_matrix_of(edge)?;
        provider
          .transition_matrix(q, length)
          .map_err(|err| Report::new(err.on_edge(edge)))
      })
      .collect::<Vec<_>>();

    // First error in tree order, regardless of thread scheduling
    for (id, p) in stale.into_iter().zip(computed) {
      self.transitions[id.0] = Some(p?);
    }
    trace!("Updated transition matrices, cache: {:?}", self.provider.stats());
    Ok(())
  }

  /// Recomputes the invalidated partials, children before parents
  fn update_partials(&mut self) -> Result<(), Report> {
    let shape = (self.patterns.n_patterns(), self.model.n_states());
    for id in self.tree.postorder() {
      if self.partials[id.0].is_some() {
        continue;
      }
      let children = self
        .tree
        .children(id)
        .iter()
        .map(|child| match (&self.partials[child.0], &self.transitions[child.0]) {
          (Some(partial), Some(p)) => Ok((partial, p)),
          _ => Err(make_internal_report!(
            "Partial or transition matrix of node '{}' is missing",
            self.tree.name(*child)
          )),
        })
        .collect::<Result<Vec<_>, Report>>()?;
      let partial = Partial::combine(children, shape);
      self.partials[id.0] = Some(partial);
    }
    Ok(())
  }

  /// Log-likelihood of every pattern
  pub fn pattern_log_likelihoods(&mut self) -> Result<Array1<f64>, Report> {
    self.update_transitions()?;
    self.update_partials()?;
    let root = self.tree.root();
    let Some(root_partial) = &self.partials[root.0] else {
      return make_internal_error!("Partial of the root is missing after update");
    };
    self.n_evaluations += 1;
    Ok(root_partial.log_likelihoods(self.assignment.root_freqs()))
  }

  /// Total log-likelihood: sum of the pattern log-likelihoods weighted by the pattern multiplicities, in pattern
  /// order
  pub fn log_likelihood(&mut self) -> Result<f64, Report> {
    let per_pattern = self.pattern_log_likelihoods()?;
    Ok(weighted_sum(&per_pattern, self.patterns.weights()))
  }

  /// Log-likelihood of every alignment column
  pub fn column_log_likelihoods(&mut self) -> Result<Array1<f64>, Report> {
    let per_pattern = self.pattern_log_likelihoods()?;
    Ok(self.patterns.expand(&per_pattern))
  }

  /// Log-likelihood at the given parameters, keeping the current ones afterwards
  pub fn log_likelihood_at(&mut self, params: &ParameterSet) -> Result<f64, Report> {
    let current = self.params.clone();
    self.set_params(params.clone())?;
    let result = self.log_likelihood();
    self.set_params(current)?;
    result
  }

  pub fn edge_statistics(&self) -> Result<Vec<EdgeStats>, Report> {
    self
      .tree
      .edges()
      .into_iter()
      .map(|id| {
        let edge = self.tree.name(id);
        let length = self.params.length(edge)?;
        let process = self
          .assignment
          .process_of(edge)
          .ok_or_else(|| make_report!("Edge '{edge}' has no process"))?;
        let rate = self.assignment.rate_matrix_of(edge)?.expected_rate();
        Ok(EdgeStats {
          edge: edge.to_owned(),
          length,
          process,
          expected_substitutions: length * rate,
        })
      })
      .collect()
  }

  /// Copy of the tree with the current edge lengths
  pub fn fitted_tree(&self) -> Result<Tree, Report> {
    let mut tree = self.tree.clone();
    for id in self.tree.edges() {
      let length = self.params.length(self.tree.name(id))?;
      tree.set_length(id, length)?;
    }
    Ok(tree)
  }
}

/// Tree tips and data taxa must match one-to-one
pub fn check_topology<'a>(tree: &Tree, taxa: impl IntoIterator<Item = &'a str>) -> Result<(), LikelihoodError> {
  let (missing_in_alignment, missing_in_tree) = tree.compare_tips(taxa);
  if missing_in_alignment.is_empty() && missing_in_tree.is_empty() {
    Ok(())
  } else {
    Err(LikelihoodError::InconsistentTopology {
      missing_in_alignment,
      missing_in_tree,
    })
  }
}

/// Sum of `values * weights` in index order. Zero weights are skipped so that impossible but absent patterns do not
/// turn the sum into NaN.
fn weighted_sum(values: &Array1<f64>, weights: &[f64]) -> f64 {
  values
    .iter()
    .zip(weights)
    .filter(|(_, w)| **w != 0.0)
    .map(|(v, w)| v * w)
    .sum()
}

use crate::alignment::alignment::Alignment;
use crate::model::model_family::SubstitutionModel;
use crate::params::parameter_set::ParameterSet;
use crate::process::assignment::ProcessAssignment;
use crate::transition::provider::{TransitionOptions, TransitionProvider};
use crate::tree::tree::Tree;
use crate::utils::random::{get_random_number_generator, random_index_weighted};
use crate::{make_error, make_report};
use eyre::{Report, WrapErr};
use itertools::Itertools;
use log::debug;
use rand::Rng;

/// Simulates an alignment of `n_sites` columns along the tree.
///
/// Root states are drawn from the root frequencies. Going down the tree, the state of every node is drawn from the
/// row of the transition matrix of the edge above it selected by the state of its parent. Only tip sequences are
/// returned, in tree order.
pub fn simulate_alignment(
  model: &SubstitutionModel,
  tree: &Tree,
  params: &ParameterSet,
  n_sites: usize,
  seed: Option<u64>,
) -> Result<Alignment, Report> {
  let mut rng = get_random_number_generator(seed);
  simulate_alignment_with_rng(model, tree, params, n_sites, &mut rng)
}

pub fn simulate_alignment_with_rng(
  model: &SubstitutionModel,
  tree: &Tree,
  params: &ParameterSet,
  n_sites: usize,
  rng: &mut impl Rng,
) -> Result<Alignment, Report> {
  if params.edges().len() != tree.len() - 1 {
    return make_error!(
      "Parameters have {} edges, but the tree has {}",
      params.edges().len(),
      tree.len() - 1
    );
  }

  let assignment = ProcessAssignment::new(model, params)?;
  let mut provider = TransitionProvider::new(TransitionOptions::default());
  for process in assignment.processes() {
    provider.prepare(&process.rate_matrix);
  }

  let mut states = vec![Vec::<usize>::new(); tree.len()];

  let root_freqs = assignment.root_freqs();
  states[tree.root().0] = (0..n_sites)
    .map(|_| random_index_weighted(&root_freqs.view(), rng))
    .collect::<Result<_, Report>>()
    .wrap_err("When drawing root states")?;

  for id in tree.edges() {
    let edge = tree.name(id);
    let q = assignment.rate_matrix_of(edge)?;
    let length = params.length(edge)?;
    let p = provider
      .transition_matrix(q, length)
      .map_err(|err| Report::new(err.on_edge(edge)))?;

    let Some(parent) = tree.parent(id) else {
      return make_error!("Edge '{edge}' has no parent node");
    };
    let drawn = states[parent.0]
      .iter()
      .map(|&s| random_index_weighted(&p.row(s), rng))
      .collect::<Result<Vec<_>, Report>>()
      .wrap_err_with(|| format!("When drawing states of node '{edge}'"))?;
    states[id.0] = drawn;
  }

  let alphabet = model.alphabet();
  let seqs = tree
    .tips()
    .into_iter()
    .map(|id| {
      let seq = states[id.0]
        .iter()
        .map(|&s| alphabet.state(s).ok_or_else(|| make_report!("State index {s} is out of range")))
        .collect::<Result<Vec<_>, Report>>()?
        .join("");
      Ok((tree.name(id).to_owned(), seq))
    })
    .collect::<Result<Vec<_>, Report>>()?;

  debug!(
    "Simulated {n_sites} sites for {} taxa: {}",
    seqs.len(),
    seqs.iter().map(|(name, _)| name).join(", ")
  );

  Alignment::from_pairs(alphabet, seqs)
}

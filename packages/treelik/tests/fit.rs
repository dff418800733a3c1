use approx::{assert_abs_diff_eq, assert_relative_eq};
use ctor::ctor;
use eyre::Report;
use itertools::Itertools;
use lazy_static::lazy_static;
use log::LevelFilter;
use pretty_assertions::assert_eq;
use rstest::rstest;
use treelik::alignment::patterns::Patterns;
use treelik::alphabet::alphabet::{Alphabet, AlphabetName};
use treelik::fit::fitter::{CancellationToken, FitOptions, FitResult, FitState, Fitter};
use treelik::io::json::{json_read_str, json_write_str, JsonPretty};
use treelik::likelihood::likelihood_function::LikelihoodFunction;
use treelik::model::model_family::{ModelFamily, SubstitutionModel};
use treelik::params::parameter_set::{ParamValue, ParameterSet};
use treelik::params::rule::ParamRule;
use treelik::simulate::simulate::simulate_alignment;
use treelik::tree::tree::Tree;
use treelik::utils::global_init::{global_init, setup_logger};

#[ctor]
fn init() {
  global_init();
  setup_logger(LevelFilter::Warn);
}

lazy_static! {
  static ref NUC: Alphabet = Alphabet::new(AlphabetName::Nuc).unwrap();
}

const TRUE_TREE: &str = "((A:0.1,B:0.2)AB:0.15,C:0.3,D:0.25)root;";
const START_TREE: &str = "((A:0.05,B:0.05)AB:0.05,C:0.05,D:0.05)root;";
const TAXA: [&str; 4] = ["A", "B", "C", "D"];

/// All 4^4 site patterns of the four taxa
fn all_patterns() -> Vec<Vec<&'static str>> {
  (0..TAXA.len())
    .map(|_| ["A", "C", "G", "T"])
    .multi_cartesian_product()
    .collect_vec()
}

/// Patterns weighted by their expected counts in `n_sites` sites under the given parameters
fn expected_patterns(model: &SubstitutionModel, params: &ParameterSet, n_sites: f64) -> Result<Patterns, Report> {
  let patterns = all_patterns();
  let unit = Patterns::with_weights(&NUC, &TAXA, &patterns, &vec![1.0; patterns.len()])?;
  let mut lf = LikelihoodFunction::with_patterns(model.clone(), Tree::from_newick(TRUE_TREE)?, unit)?;
  lf.set_params(params.clone())?;
  let probs = lf.pattern_log_likelihoods()?.mapv(f64::exp);
  assert_abs_diff_eq!(probs.sum(), 1.0, epsilon = 1e-10);
  let weights = probs.iter().map(|p| p * n_sites).collect_vec();
  Patterns::with_weights(&NUC, &TAXA, &patterns, &weights)
}

#[rstest]
fn recovers_parameters_from_expected_pattern_counts() -> Result<(), Report> {
  let model = SubstitutionModel::new(ModelFamily::K80, &NUC, Default::default())?;
  let true_tree = Tree::from_newick(TRUE_TREE)?;
  let mut truth = ParameterSet::new(&model, &true_tree);
  truth.set_all("kappa", &ParamValue::Scalar(4.0))?;
  let patterns = expected_patterns(&model, &truth, 1000.0)?;

  let lf = LikelihoodFunction::with_patterns(model, Tree::from_newick(START_TREE)?, patterns)?;
  let options = FitOptions {
    tolerance: 1e-10,
    max_iter: 1000,
    ..FitOptions::default()
  };
  let result = Fitter::new(lf, options).run()?;

  assert_eq!(result.status, FitState::Converged);
  assert_relative_eq!(result.params.scalar("kappa", "A")?, 4.0, max_relative = 1e-3);
  for edge in true_tree.edge_names() {
    assert_relative_eq!(result.params.length(edge)?, truth.length(edge)?, max_relative = 1e-3);
  }
  Ok(())
}

#[rstest]
fn recovers_parameters_from_simulated_alignment() -> Result<(), Report> {
  let model = SubstitutionModel::new(ModelFamily::HKY85, &NUC, Default::default())?;
  let true_tree = Tree::from_newick(TRUE_TREE)?;
  let mut truth = ParameterSet::new(&model, &true_tree);
  truth.set_all("kappa", &ParamValue::Scalar(3.0))?;
  let true_freqs = vec![0.35, 0.15, 0.2, 0.3];
  truth.set_all("freqs", &ParamValue::Simplex(true_freqs.clone()))?;
  let aln = simulate_alignment(&model, &true_tree, &truth, 20000, Some(7))?;

  let lf = LikelihoodFunction::new(model, Tree::from_newick(START_TREE)?, &aln)?;
  let result = Fitter::new(lf, FitOptions::default()).run()?;

  assert_relative_eq!(result.params.scalar("kappa", "A")?, 3.0, max_relative = 0.15);
  let freqs = result.params.value("freqs", "A")?.as_simplex().map(<[f64]>::to_vec).unwrap_or_default();
  for (fitted, expected) in freqs.iter().zip(true_freqs.iter()) {
    assert_abs_diff_eq!(*fitted, *expected, epsilon = 0.02);
  }
  for edge in true_tree.edge_names() {
    assert_relative_eq!(result.params.length(edge)?, truth.length(edge)?, max_relative = 0.15);
  }
  Ok(())
}

#[rstest]
fn cancellation_returns_initial_parameters() -> Result<(), Report> {
  let model = SubstitutionModel::new(ModelFamily::HKY85, &NUC, Default::default())?;
  let tree = Tree::from_newick(TRUE_TREE)?;
  let aln = simulate_alignment(&model, &tree, &ParameterSet::new(&model, &tree), 200, Some(1))?;
  let lf = LikelihoodFunction::new(model, Tree::from_newick(START_TREE)?, &aln)?;
  let initial = lf.params().clone();

  let token = CancellationToken::new();
  let mut fitter = Fitter::new(lf, FitOptions::default()).with_cancellation(token.clone());
  token.cancel();
  let result = fitter.run()?;

  assert_eq!(result.status, FitState::Cancelled);
  assert_eq!(result.params, initial);
  assert_eq!(fitter.likelihood_function().params(), &initial);
  assert!(result.log_likelihood.is_finite());
  Ok(())
}

#[rstest]
fn bound_lengths_stay_equal_and_reduce_free_parameters() -> Result<(), Report> {
  let model = SubstitutionModel::new(ModelFamily::JC69, &NUC, Default::default())?;
  let tree = Tree::from_newick(TRUE_TREE)?;
  let aln = simulate_alignment(&model, &tree, &ParameterSet::new(&model, &tree), 500, Some(5))?;

  let free = LikelihoodFunction::new(model.clone(), Tree::from_newick(START_TREE)?, &aln)?;
  let mut bound = LikelihoodFunction::new(model, Tree::from_newick(START_TREE)?, &aln)?;
  bound.apply_rule(&ParamRule::new("length").edges(&["A", "B", "C", "D"]))?;
  assert_eq!(free.params().n_free_params(), 5);
  assert_eq!(bound.params().n_free_params(), 2);

  let free = Fitter::new(free, FitOptions::default()).run()?;
  let bound = Fitter::new(bound, FitOptions::default()).run()?;

  let tip_lengths = TAXA.iter().map(|tip| bound.params.length(tip)).collect::<Result<Vec<_>, Report>>()?;
  assert!(tip_lengths.iter().all_equal());
  assert_eq!(bound.n_free_params, 2);
  assert!(free.log_likelihood >= bound.log_likelihood - 1e-3);
  assert_abs_diff_eq!(free.aic, 2.0 * 5.0 - 2.0 * free.log_likelihood, epsilon = 1e-9);
  Ok(())
}

#[rstest]
fn serializes_parameters_and_results_losslessly() -> Result<(), Report> {
  let model = SubstitutionModel::new(ModelFamily::GTR, &NUC, Default::default())?;
  let tree = Tree::from_newick(TRUE_TREE)?;
  let mut params = ParameterSet::new(&model, &tree);
  params.apply_rule(
    &ParamRule::new("freqs")
      .edges(&[] as &[&str])
      .root(true)
      .init(ParamValue::Simplex(vec![0.1, 0.2, 0.3, 0.4])),
    &tree,
  )?;
  params.apply_rule(&ParamRule::new("A/C").clade("AB").independent(), &tree)?;
  params.set_length("C", 0.123_456_789_012_345)?;

  let restored = ParameterSet::from_json(params.to_json()?)?;
  assert_eq!(restored, params);

  let aln = simulate_alignment(&model, &tree, &params, 100, Some(3))?;
  let lf = LikelihoodFunction::new(model, tree, &aln)?;
  let options = FitOptions {
    max_iter: 2,
    ..FitOptions::default()
  };
  let result = Fitter::new(lf, options).run()?;
  let restored: FitResult = json_read_str(json_write_str(&result, JsonPretty(false))?)?;
  assert_eq!(restored, FitResult { warning: None, ..result.clone() });

  let dir = std::env::temp_dir();
  let params_file = dir.join(format!("treelik-params-{}.json", std::process::id()));
  let result_file = dir.join(format!("treelik-fit-{}.json", std::process::id()));
  params.save_json(&params_file)?;
  result.save_json(&result_file)?;
  let loaded_params = ParameterSet::load_json(&params_file)?;
  let loaded_result = FitResult::load_json(&result_file)?;
  std::fs::remove_file(&params_file)?;
  std::fs::remove_file(&result_file)?;
  assert_eq!(loaded_params, params);
  assert_eq!(loaded_result, FitResult { warning: None, ..result });
  Ok(())
}

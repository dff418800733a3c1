use approx::assert_abs_diff_eq;
use ctor::ctor;
use eyre::Report;
use indoc::indoc;
use itertools::Itertools;
use lazy_static::lazy_static;
use log::LevelFilter;
use pretty_assertions::assert_eq;
use rstest::rstest;
use treelik::alignment::alignment::Alignment;
use treelik::alignment::patterns::Patterns;
use treelik::alphabet::alphabet::{Alphabet, AlphabetName};
use treelik::likelihood::likelihood_function::LikelihoodFunction;
use treelik::model::model_family::{ModelFamily, SubstitutionModel};
use treelik::params::parameter_set::{ParamKind, ParamValue, ParameterSet};
use treelik::params::rule::ParamRule;
use treelik::tree::tree::Tree;
use treelik::utils::error::{find_likelihood_error, LikelihoodError};
use treelik::utils::global_init::{global_init, setup_logger};

#[ctor]
fn init() {
  global_init();
  setup_logger(LevelFilter::Warn);
}

lazy_static! {
  static ref NUC: Alphabet = Alphabet::new(AlphabetName::Nuc).unwrap();
}

const TREE: &str = "((A:0.1,B:0.2)AB:0.3,(C:0.2,D:0.4)CD:0.5)root;";

fn alignment() -> Alignment {
  let fasta = indoc! {"
    A ACGTTGCAACGTAAGTCCGA
    B ACGTTGCTACGTAAGACCGA
    C ACCTTGCAAGGTAAGTCAGA
    D TCCTAGCAAGGTTAGTCAGG
  "};
  let pairs = fasta
    .lines()
    .filter_map(|line| line.split_once(' '))
    .map(|(name, seq)| (name.to_owned(), seq.to_owned()))
    .collect_vec();
  Alignment::from_pairs(&NUC, pairs).unwrap()
}

/// Sets every rate parameter to a distinct value and the frequencies to a non-uniform vector
fn perturbed(mut params: ParameterSet) -> Result<ParameterSet, Report> {
  let rates = params
    .params()
    .filter(|p| p.kind == ParamKind::Rate)
    .map(|p| p.name.clone())
    .collect_vec();
  for (i, name) in rates.iter().enumerate() {
    params.set_all(name, &ParamValue::Scalar(0.5 + 0.37 * i as f64))?;
  }
  if params.contains("freqs") {
    params.set_all("freqs", &ParamValue::Simplex(vec![0.1, 0.2, 0.3, 0.4]))?;
  }
  Ok(params)
}

fn log_likelihood(family: ModelFamily, tree: Tree, root_freqs: Option<&[f64]>) -> Result<f64, Report> {
  let model = SubstitutionModel::new(family, &NUC, Default::default())?;
  let mut params = perturbed(ParameterSet::new(&model, &tree))?;
  if let Some(root_freqs) = root_freqs {
    let rule = ParamRule::new("freqs")
      .edges(&[] as &[&str])
      .root(true)
      .init(ParamValue::Simplex(root_freqs.to_vec()));
    params.apply_rule(&rule, &tree)?;
  }
  let mut lf = LikelihoodFunction::new(model, tree, &alignment())?;
  lf.set_params(params)?;
  lf.log_likelihood()
}

#[rstest]
fn matches_closed_form_of_jc69_cherry() -> Result<(), Report> {
  let model = SubstitutionModel::new(ModelFamily::JC69, &NUC, Default::default())?;
  let tree = Tree::from_newick("(a:0.1,b:0.1)root;")?;
  let aln = Alignment::from_pairs(&NUC, [("a", "A"), ("b", "A")])?;
  let mut lf = LikelihoodFunction::new(model, tree, &aln)?;
  let p_same = |t: f64| 0.25 + 0.75 * (-4.0 * t / 3.0).exp();
  let p_diff = |t: f64| 0.25 - 0.25 * (-4.0 * t / 3.0).exp();
  let expected = (0.25 * (p_same(0.1).powi(2) + 3.0 * p_diff(0.1).powi(2))).ln();
  assert_abs_diff_eq!(lf.log_likelihood()?, expected, epsilon = 1e-6);
  Ok(())
}

#[rstest]
#[case(ModelFamily::JC69)]
#[case(ModelFamily::K80)]
#[case(ModelFamily::HKY85)]
#[case(ModelFamily::T92)]
#[case(ModelFamily::GTR)]
fn reversible_stationary_likelihood_does_not_depend_on_root(#[case] family: ModelFamily) -> Result<(), Report> {
  let tree = Tree::from_newick(TREE)?;
  let at_root = log_likelihood(family, tree.clone(), None)?;
  for node in ["AB", "CD"] {
    let rerooted = log_likelihood(family, tree.rerooted_at(node)?, None)?;
    assert_abs_diff_eq!(at_root, rerooted, epsilon = 1e-9);
  }
  Ok(())
}

#[rstest]
fn non_reversible_likelihood_depends_on_root() -> Result<(), Report> {
  let tree = Tree::from_newick(TREE)?;
  let at_root = log_likelihood(ModelFamily::GN, tree.clone(), None)?;
  let rerooted = log_likelihood(ModelFamily::GN, tree.rerooted_at("CD")?, None)?;
  assert!((at_root - rerooted).abs() > 1e-6, "{at_root} vs {rerooted}");
  Ok(())
}

#[rstest]
fn separate_root_frequencies_make_likelihood_depend_on_root() -> Result<(), Report> {
  let tree = Tree::from_newick(TREE)?;
  let root_freqs = [0.7, 0.1, 0.1, 0.1];
  let at_root = log_likelihood(ModelFamily::GTR, tree.clone(), Some(&root_freqs))?;
  let rerooted = log_likelihood(ModelFamily::GTR, tree.rerooted_at("CD")?, Some(&root_freqs))?;
  assert!((at_root - rerooted).abs() > 1e-6, "{at_root} vs {rerooted}");
  Ok(())
}

#[rstest]
fn zero_length_star_with_identical_sequences_gives_root_frequencies() -> Result<(), Report> {
  let model = SubstitutionModel::new(ModelFamily::F81, &NUC, Default::default())?;
  let tree = Tree::from_newick("(A:0,B:0,C:0)root;")?;
  let aln = Alignment::from_pairs(&NUC, [("A", "AAC"), ("B", "AAC"), ("C", "AAC")])?;
  let mut lf = LikelihoodFunction::new(model, tree, &aln)?;
  lf.set_value("freqs", "A", ParamValue::Simplex(vec![0.4, 0.3, 0.2, 0.1]))?;
  assert_abs_diff_eq!(lf.log_likelihood()?, 2.0 * 0.4_f64.ln() + 0.3_f64.ln(), epsilon = 1e-12);
  Ok(())
}

#[rstest]
fn rejects_tree_not_matching_alignment() -> Result<(), Report> {
  let model = SubstitutionModel::new(ModelFamily::JC69, &NUC, Default::default())?;
  let tree = Tree::from_newick("((A:0.1,B:0.1)AB:0.1,C:0.1)root;")?;
  let aln = Alignment::from_pairs(&NUC, [("A", "AC"), ("B", "AC"), ("X", "AG")])?;
  let report = LikelihoodFunction::new(model, tree, &aln).unwrap_err();
  assert_eq!(
    find_likelihood_error(&report),
    Some(&LikelihoodError::InconsistentTopology {
      missing_in_alignment: vec!["C".to_owned()],
      missing_in_tree: vec!["X".to_owned()],
    })
  );
  Ok(())
}

#[rstest]
fn pattern_compression_preserves_likelihood() -> Result<(), Report> {
  let model = SubstitutionModel::new(ModelFamily::HKY85, &NUC, Default::default())?;
  let tree = Tree::from_newick(TREE)?;
  let aln = alignment();

  let mut compressed = LikelihoodFunction::new(model.clone(), tree.clone(), &aln)?;
  assert!(compressed.patterns().n_patterns() < aln.len());

  let names = aln.names().collect_vec();
  let columns = (0..aln.len()).map(|i| aln.column(i)).collect::<Result<Vec<_>, Report>>()?;
  let patterns = Patterns::with_weights(&NUC, &names, &columns, &vec![1.0; aln.len()])?;
  let mut uncompressed = LikelihoodFunction::with_patterns(model, tree, patterns)?;

  assert_abs_diff_eq!(compressed.log_likelihood()?, uncompressed.log_likelihood()?, epsilon = 1e-10);
  assert_abs_diff_eq!(
    compressed.column_log_likelihoods()?,
    uncompressed.column_log_likelihoods()?,
    epsilon = 1e-12
  );
  Ok(())
}

#[rstest]
fn impossible_pattern_gives_negative_infinity() -> Result<(), Report> {
  let model = SubstitutionModel::new(ModelFamily::JC69, &NUC, Default::default())?;
  let tree = Tree::from_newick("(A:0,B:0)root;")?;
  let aln = Alignment::from_pairs(&NUC, [("A", "AC"), ("B", "AG")])?;
  let mut lf = LikelihoodFunction::new(model, tree, &aln)?;
  assert_eq!(lf.log_likelihood()?, f64::NEG_INFINITY);
  let columns = lf.column_log_likelihoods()?;
  assert_abs_diff_eq!(columns[0], 0.25_f64.ln(), epsilon = 1e-12);
  assert_eq!(columns[1], f64::NEG_INFINITY);
  Ok(())
}

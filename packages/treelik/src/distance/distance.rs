use crate::alignment::alignment::Alignment;
use crate::fit::fitter::{FitOptions, FitState, Fitter};
use crate::likelihood::likelihood_function::LikelihoodFunction;
use crate::model::model_family::SubstitutionModel;
use crate::params::parameter_set::LENGTH;
use crate::params::rule::ParamRule;
use crate::tree::tree::Tree;
use crate::{make_error, make_report};
use eyre::{Report, WrapErr};
use itertools::Itertools;
use log::warn;
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Initial length of each of the two edges of a pair tree
const PAIR_INIT_LENGTH: f64 = 0.05;

/// Symmetric matrix of distances between taxa
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistanceMatrix {
  pub names: Vec<String>,
  pub values: Array2<f64>,
}

impl DistanceMatrix {
  pub fn get(&self, a: &str, b: &str) -> Result<f64, Report> {
    let index = |name: &str| {
      self
        .names
        .iter()
        .position(|n| n == name)
        .ok_or_else(|| make_report!("Taxon '{name}' is not in the distance matrix"))
    };
    Ok(self.values[[index(a)?, index(b)?]])
  }
}

/// Jukes-Cantor correction of a proportion of differing sites: `-3/4 ln(1 - 4/3 p)`.
///
/// Saturated proportions (`p >= 3/4`) give an infinite distance.
pub fn jc69_distance(p: f64) -> Result<f64, Report> {
  if !(0.0..=1.0).contains(&p) {
    return make_error!("Proportion of differing sites must be within [0, 1], but found {p}");
  }
  let x = 1.0 - 4.0 / 3.0 * p;
  if x <= 0.0 {
    return Ok(f64::INFINITY);
  }
  Ok(-0.75 * x.ln())
}

pub fn pairwise_p_distances(aln: &Alignment) -> Result<DistanceMatrix, Report> {
  pairwise(aln, |a, b| aln.p_distance(a, b))
}

pub fn pairwise_jc69_distances(aln: &Alignment) -> Result<DistanceMatrix, Report> {
  pairwise(aln, |a, b| jc69_distance(aln.p_distance(a, b)?))
}

/// Maximum likelihood distance between two taxa: the taxa are joined by a two-edge tree whose edge lengths are bound
/// to one value. Only that value is fitted; frequencies are set to the empirical frequencies of the pair and other
/// parameters keep their default values. The distance is the sum of both lengths.
pub fn ml_distance(
  model: &SubstitutionModel,
  aln: &Alignment,
  a: &str,
  b: &str,
  options: &FitOptions,
) -> Result<f64, Report> {
  if a == b {
    return Ok(0.0);
  }
  let pair = aln.take_taxa(&[a, b])?;
  let root = ["root", "root_", "root__"]
    .into_iter()
    .find(|name| *name != a && *name != b)
    .unwrap_or("root");
  let tree = Tree::from_edges([(root, a, PAIR_INIT_LENGTH), (root, b, PAIR_INIT_LENGTH)])?;

  let mut lf = LikelihoodFunction::new(model.clone(), tree, &pair)?;
  lf.use_empirical_freqs(&pair)?;
  let names = lf.params().names().map(ToOwned::to_owned).collect_vec();
  for name in names {
    let rule = if name == LENGTH {
      ParamRule::new(&name)
    } else {
      ParamRule::new(&name).constant()
    };
    lf.apply_rule(&rule)?;
  }

  let mut fitter = Fitter::new(lf, *options);
  let result = fitter.run()?;
  if result.status != FitState::Converged {
    warn!("Distance between '{a}' and '{b}' was estimated by a fit with status '{}'", result.status);
  }
  Ok(2.0 * result.params.length(a)?)
}

/// Maximum likelihood distances between all pairs of taxa, computed in parallel
pub fn pairwise_ml_distances(
  model: &SubstitutionModel,
  aln: &Alignment,
  options: &FitOptions,
) -> Result<DistanceMatrix, Report> {
  pairwise(aln, |a, b| ml_distance(model, aln, a, b, options))
}

fn pairwise(
  aln: &Alignment,
  distance: impl Fn(&str, &str) -> Result<f64, Report> + Sync,
) -> Result<DistanceMatrix, Report> {
  let names = aln.names().map(ToOwned::to_owned).collect_vec();
  let n = names.len();
  let pairs = (0..n).tuple_combinations::<(usize, usize)>().collect_vec();

  let computed = pairs
    .par_iter()
    .map(|&(i, j)| {
      distance(&names[i], &names[j])
        .wrap_err_with(|| format!("When computing distance between '{}' and '{}'", names[i], names[j]))
    })
    .collect::<Vec<_>>();

  let mut values = Array2::<f64>::zeros((n, n));
  for ((i, j), d) in pairs.into_iter().zip(computed) {
    let d = d?;
    values[[i, j]] = d;
    values[[j, i]] = d;
  }
  Ok(DistanceMatrix { names, values })
}

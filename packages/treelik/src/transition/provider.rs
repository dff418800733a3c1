use crate::model::rate_matrix::{RateMatrix, RateMatrixKey};
use crate::transition::eigen::Decomposition;
use crate::transition::expm::{correct_stochastic, expm};
use crate::utils::error::LikelihoodError;
use log::trace;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
pub struct TransitionOptions {
  /// Largest accepted error of the eigendecomposition when reconstructing Q, relative to the largest rate
  #[default = 1e-8]
  pub eigen_tolerance: f64,

  /// Largest accepted deviation of a transition matrix from row-stochasticity before correction
  #[default = 1e-6]
  pub stochastic_tolerance: f64,
}

/// Counters of the transition matrix computations performed by one provider
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
  /// Eigendecompositions computed
  pub decompositions: usize,
  /// Transition matrices served from a cached eigendecomposition
  pub hits: usize,
  /// Transition matrices computed with the matrix exponential
  pub fallbacks: usize,
}

#[derive(Debug, Default)]
struct Counters {
  decompositions: AtomicUsize,
  hits: AtomicUsize,
  fallbacks: AtomicUsize,
}

/// Computes `P(t) = exp(Q t)`, caching eigendecompositions keyed by the identity of Q. Reversible matrices are
/// decomposed with the symmetric eigensolver, other diagonalizable matrices with the general one.
///
/// The cache is owned by the provider: each likelihood function owns its own provider, and nothing is shared between
/// providers. Decompositions are added through `prepare()`, after which `transition_matrix()` only reads the cache
/// and can be called from several threads.
#[derive(Debug, Default)]
pub struct TransitionProvider {
  options: TransitionOptions,
  decompositions: HashMap<RateMatrixKey, Option<Arc<Decomposition>>>,
  counters: Counters,
}

impl TransitionProvider {
  pub fn new(options: TransitionOptions) -> Self {
    Self {
      options,
      decompositions: HashMap::new(),
      counters: Counters::default(),
    }
  }

  pub const fn options(&self) -> &TransitionOptions {
    &self.options
  }

  /// Computes and caches the eigendecomposition of Q, unless already cached. Matrices which can not be decomposed
  /// are remembered too, so that they go straight to the matrix exponential.
  pub fn prepare(&mut self, q: &RateMatrix) {
    let key = q.key();
    if self.decompositions.contains_key(&key) {
      return;
    }
    let decomposition = Decomposition::new(q, self.options.eigen_tolerance).map(Arc::new);
    if decomposition.is_none() {
      trace!("Rate matrix {key:?} has no usable eigendecomposition, falling back to the matrix exponential");
    }
    self.counters.decompositions.fetch_add(1, Ordering::Relaxed);
    self.decompositions.insert(key, decomposition);
  }

  /// Transition matrix for edge length `t`. Uses the cached eigendecomposition of Q when there is one and when its
  /// result is a valid stochastic matrix; uses the matrix exponential otherwise.
  pub fn transition_matrix(&self, q: &RateMatrix, t: f64) -> Result<Array2<f64>, LikelihoodError> {
    if !(t.is_finite() && t >= 0.0) {
      return Err(LikelihoodError::invalid_parameter(
        "length",
        format!("must be finite and non-negative, but found {t}"),
      ));
    }

    if t == 0.0 {
      return Ok(Array2::eye(q.len()));
    }

    let tolerance = self.options.stochastic_tolerance;

    let cached = self.decompositions.get(&q.key()).cloned().flatten();
    let decomposition = match cached {
      Some(decomposition) => Some(decomposition),
      None if !self.decompositions.contains_key(&q.key()) => {
        Decomposition::new(q, self.options.eigen_tolerance).map(Arc::new)
      }
      None => None,
    };

    let eigen_error = match decomposition {
      Some(decomposition) => match correct_stochastic(decomposition.transition_matrix(t), tolerance) {
        Ok(p) => {
          self.counters.hits.fetch_add(1, Ordering::Relaxed);
          return Ok(p);
        }
        Err(err) => Some(err),
      },
      None => None,
    };

    self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
    correct_stochastic(expm(q.q(), t), tolerance).map_err(|err| {
      let reason = match eigen_error {
        Some(eigen_error) => format!(
          "eigendecomposition gave an invalid matrix ({eigen_error}) and matrix exponential gave an invalid matrix ({err})"
        ),
        None => format!("matrix exponential gave an invalid matrix ({err})"),
      };
      LikelihoodError::SingularRateMatrix {
        edge: None,
        length: t,
        reason,
      }
    })
  }

  /// Prepares and computes in one step
  pub fn compute(&mut self, q: &RateMatrix, t: f64) -> Result<Array2<f64>, LikelihoodError> {
    self.prepare(q);
    self.transition_matrix(q, t)
  }

  pub fn n_cached(&self) -> usize {
    self.decompositions.len()
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      decompositions: self.counters.decompositions.load(Ordering::Relaxed),
      hits: self.counters.hits.load(Ordering::Relaxed),
      fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
    }
  }

  /// Forget cached decompositions of matrices other than the given ones
  pub fn retain(&mut self, keys: &[RateMatrixKey]) {
    self.decompositions.retain(|key, _| keys.contains(key));
  }

  /// Forget all cached decompositions, keeping the counters
  pub fn clear(&mut self) {
    self.decompositions.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::utils::ndarray::row_sums;
  use approx::assert_abs_diff_eq;
  use eyre::Report;
  use ndarray::{array, Array1};
  use rstest::rstest;

  fn jc() -> RateMatrix {
    RateMatrix::new(&Array2::ones((4, 4)), &Array1::from_elem(4, 0.25))
      .and_then(RateMatrix::normalized)
      .unwrap()
  }

  fn gn() -> RateMatrix {
    let r = array![
      [0.0, 1.0, 2.0, 0.5],
      [3.0, 0.0, 0.3, 4.0],
      [2.0, 0.1, 0.0, 1.0],
      [0.5, 4.0, 7.0, 0.0],
    ];
    RateMatrix::new(&r, &array![0.1, 0.2, 0.3, 0.4])
      .and_then(RateMatrix::normalized)
      .unwrap()
  }

  #[rstest]
  fn returns_identity_at_zero_length() -> Result<(), Report> {
    let mut provider = TransitionProvider::default();
    for q in [jc(), gn()] {
      assert_abs_diff_eq!(provider.compute(&q, 0.0)?, Array2::<f64>::eye(4), epsilon = 0.0);
    }
    Ok(())
  }

  #[rstest]
  #[case(0.01)]
  #[case(0.5)]
  #[case(3.0)]
  #[case(100.0)]
  fn rows_are_stochastic(#[case] t: f64) -> Result<(), Report> {
    let mut provider = TransitionProvider::default();
    for q in [jc(), gn()] {
      let p = provider.compute(&q, t)?;
      for s in row_sums(&p.view()) {
        assert_abs_diff_eq!(s, 1.0, epsilon = 1e-9);
      }
      assert!(p.iter().all(|&x| (0.0..=1.0).contains(&x)));
    }
    Ok(())
  }

  #[rstest]
  fn eigen_and_exponential_agree() -> Result<(), Report> {
    let r = array![
      [0.0, 1.0, 2.0, 0.5],
      [1.0, 0.0, 0.3, 4.0],
      [2.0, 0.3, 0.0, 1.0],
      [0.5, 4.0, 1.0, 0.0],
    ];
    let q = RateMatrix::new(&r, &array![0.1, 0.2, 0.3, 0.4])?.normalized()?;
    let mut provider = TransitionProvider::default();
    let p = provider.compute(&q, 0.7)?;
    assert_abs_diff_eq!(p, expm(q.q(), 0.7), epsilon = 1e-10);
    assert_eq!(provider.stats().fallbacks, 0);
    Ok(())
  }

  #[rstest]
  fn reuses_decomposition_across_lengths() -> Result<(), Report> {
    let q = jc();
    let mut provider = TransitionProvider::default();
    for t in [0.1, 0.2, 0.3] {
      provider.compute(&q, t)?;
    }
    assert_eq!(
      provider.stats(),
      CacheStats {
        decompositions: 1,
        hits: 3,
        fallbacks: 0
      }
    );
    assert_eq!(provider.n_cached(), 1);

    provider.compute(&gn(), 0.1)?;
    assert_eq!(provider.n_cached(), 2);
    provider.retain(&[q.key()]);
    assert_eq!(provider.n_cached(), 1);
    Ok(())
  }

  #[rstest]
  fn caches_decomposition_of_non_reversible_matrix() -> Result<(), Report> {
    let q = gn();
    let mut provider = TransitionProvider::default();
    for t in [0.2, 0.4] {
      assert_abs_diff_eq!(provider.compute(&q, t)?, expm(q.q(), t), epsilon = 1e-9);
    }
    let stats = provider.stats();
    assert_eq!((stats.decompositions, stats.hits, stats.fallbacks), (1, 2, 0));
    Ok(())
  }

  #[rstest]
  fn defective_matrix_goes_to_exponential() -> Result<(), Report> {
    let r = array![[0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 0.0]];
    let q = RateMatrix::new(&r, &Array1::from_elem(3, 1.0 / 3.0))?;
    let mut provider = TransitionProvider::default();
    provider.compute(&q, 0.2)?;
    provider.compute(&q, 0.4)?;
    let stats = provider.stats();
    assert_eq!((stats.decompositions, stats.hits, stats.fallbacks), (1, 0, 2));
    Ok(())
  }

  #[rstest]
  fn rejects_negative_length() {
    let provider = TransitionProvider::default();
    assert!(matches!(
      provider.transition_matrix(&jc(), -0.1),
      Err(LikelihoodError::InvalidParameter { .. })
    ));
  }

  #[rstest]
  fn substitution_probability_grows_with_length() -> Result<(), Report> {
    let r = array![
      [0.0, 1.0, 2.0, 0.5],
      [1.0, 0.0, 0.3, 4.0],
      [2.0, 0.3, 0.0, 1.0],
      [0.5, 4.0, 1.0, 0.0],
    ];
    let rev = RateMatrix::new(&r, &array![0.1, 0.2, 0.3, 0.4])?.normalized()?;
    let mut provider = TransitionProvider::default();
    for q in [jc(), rev] {
      let mut prev = 0.0;
      for i in 1..=100 {
        let p = provider.compute(&q, f64::from(i) * 0.1)?;
        let changed = 1.0 - p[[1, 1]];
        assert!(changed >= prev - 1e-12, "t={}: {changed} < {prev}", f64::from(i) * 0.1);
        prev = changed;
      }
      assert_abs_diff_eq!(prev, 1.0 - q.freqs()[1], epsilon = 1e-3);
    }
    Ok(())
  }

  #[rstest]
  fn jukes_cantor_differing_states_approach_equilibrium() -> Result<(), Report> {
    let mut provider = TransitionProvider::default();
    let q = jc();
    let mut prev = 0.0;
    for i in 1..=60 {
      let t = f64::from(i) * 0.1;
      let p = provider.compute(&q, t)?;
      assert_abs_diff_eq!(p[[0, 3]], 0.25 - 0.25 * (-4.0 * t / 3.0).exp(), epsilon = 1e-12);
      assert!(p[[0, 3]] > prev);
      prev = p[[0, 3]];
    }
    Ok(())
  }
}

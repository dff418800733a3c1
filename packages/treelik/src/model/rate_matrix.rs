use crate::utils::error::LikelihoodError;
use crate::utils::ndarray::row_sums;
use eyre::Report;
use itertools::Itertools;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::collections::hash_map::DefaultHasher;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::io::Write;

/// Tolerance on the sum of equilibrium frequencies
pub const FREQS_SUM_TOLERANCE: f64 = 1e-6;

/// Tolerance of the generator and detailed balance checks
pub const GENERATOR_TOLERANCE: f64 = 1e-9;

#[derive(Copy, Clone, Debug, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
pub struct ModelOptions {
  /// Scale every rate matrix such that the expected number of substitutions per unit of edge length is 1
  #[default = true]
  pub normalize: bool,
}

/// Stable identity of a rate matrix, derived from the bit patterns of its entries and of its frequencies
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RateMatrixKey(pub u64);

/// Instantaneous rate matrix (generator) Q of a continuous-time Markov process.
///
/// Off-diagonal entries are `Q[i][j] = R[i][j] * pi[j]`, where `R` are the exchangeabilities and `pi` the
/// equilibrium frequencies. Diagonal entries are the negative row sums, so that every row sums to zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateMatrix {
  q: Array2<f64>,
  exchangeabilities: Array2<f64>,
  freqs: Array1<f64>,
  scale: f64,
}

impl RateMatrix {
  /// Build the unnormalized generator from exchangeabilities and equilibrium frequencies
  pub fn new(exchangeabilities: &Array2<f64>, freqs: &Array1<f64>) -> Result<Self, Report> {
    let n = freqs.len();
    if n == 0 {
      return Err(LikelihoodError::invalid_parameter("freqs", "frequency vector is empty").into());
    }
    if exchangeabilities.dim() != (n, n) {
      return Err(
        LikelihoodError::invalid_parameter(
          "exchangeabilities",
          format!(
            "expected a {n}x{n} matrix to match {n} frequencies, but found shape {:?}",
            exchangeabilities.shape()
          ),
        )
        .into(),
      );
    }

    validate_freqs(freqs)?;

    for ((i, j), &r) in exchangeabilities.indexed_iter() {
      if i != j && !(r.is_finite() && r >= 0.0) {
        return Err(
          LikelihoodError::invalid_parameter(
            "exchangeabilities",
            format!("entry ({i}, {j}) must be finite and non-negative, but found {r}"),
          )
          .into(),
        );
      }
    }

    let freqs = freqs / freqs.sum();

    let mut q = exchangeabilities * &freqs.view().insert_axis(Axis(0));
    q.diag_mut().fill(0.0);
    let diag = -row_sums(&q.view());
    q.diag_mut().assign(&diag);

    Ok(Self {
      q,
      exchangeabilities: exchangeabilities.clone(),
      freqs,
      scale: 1.0,
    })
  }

  pub fn with_options(
    exchangeabilities: &Array2<f64>,
    freqs: &Array1<f64>,
    options: &ModelOptions,
  ) -> Result<Self, Report> {
    let matrix = Self::new(exchangeabilities, freqs)?;
    if options.normalize {
      matrix.normalized()
    } else {
      Ok(matrix)
    }
  }

  /// Rescale so that the expected substitution rate `-sum_i pi_i Q_ii` equals 1
  pub fn normalized(self) -> Result<Self, Report> {
    let rate = self.expected_rate();
    if !(rate.is_finite() && rate > 0.0) {
      return Err(
        LikelihoodError::invalid_parameter(
          "exchangeabilities",
          format!("unable to normalize rate matrix with expected substitution rate {rate}"),
        )
        .into(),
      );
    }
    Ok(Self {
      q: self.q / rate,
      scale: self.scale / rate,
      ..self
    })
  }

  #[inline]
  pub const fn q(&self) -> &Array2<f64> {
    &self.q
  }

  #[inline]
  pub const fn freqs(&self) -> &Array1<f64> {
    &self.freqs
  }

  #[inline]
  pub const fn exchangeabilities(&self) -> &Array2<f64> {
    &self.exchangeabilities
  }

  /// Factor by which `R * pi` was multiplied to obtain the off-diagonal of Q
  #[inline]
  pub const fn scale(&self) -> f64 {
    self.scale
  }

  pub fn len(&self) -> usize {
    self.freqs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.freqs.is_empty()
  }

  /// Expected number of substitutions per unit time at equilibrium
  pub fn expected_rate(&self) -> f64 {
    -(&self.freqs * &self.q.diag()).sum()
  }

  /// Detailed balance: `pi_i Q_ij = pi_j Q_ji` for all pairs
  pub fn is_reversible(&self) -> bool {
    let flux = &self.freqs.view().insert_axis(Axis(1)) * &self.q;
    let max_rate = self.q.iter().fold(0.0_f64, |acc, x| acc.max(x.abs())).max(1.0);
    flux
      .indexed_iter()
      .all(|((i, j), f)| (f - flux[[j, i]]).abs() <= GENERATOR_TOLERANCE * max_rate)
  }

  /// Whether every row sums to zero and off-diagonal entries are non-negative
  pub fn is_valid_generator(&self) -> bool {
    let max_rate = self.q.iter().fold(0.0_f64, |acc, x| acc.max(x.abs())).max(1.0);
    let rows_ok = row_sums(&self.q.view())
      .iter()
      .all(|s| s.abs() <= GENERATOR_TOLERANCE * max_rate);
    let off_diag_ok = self.q.indexed_iter().all(|((i, j), &x)| i == j || x >= 0.0);
    rows_ok && off_diag_ok
  }

  pub fn key(&self) -> RateMatrixKey {
    let mut hasher = DefaultHasher::new();
    self.q.dim().hash(&mut hasher);
    for x in self.q.iter().chain(self.freqs.iter()) {
      x.to_bits().hash(&mut hasher);
    }
    RateMatrixKey(hasher.finish())
  }

  pub fn print<W: Write>(&self, w: &mut W, states: &[&str]) -> Result<(), Report> {
    writeln!(w, "Equilibrium frequencies (pi_i):")?;
    for (s, p) in states.iter().zip(self.freqs.iter()) {
      writeln!(w, "{s}:\t{p:.4}")?;
    }
    writeln!(w, "\nRates from i->j (Q_ij):")?;
    writeln!(w, "\t{}", states.iter().join("\t"))?;
    for (s, row) in states.iter().zip(self.q.rows()) {
      writeln!(w, "{s}\t{}", row.iter().map(|q| format!("{q:.4}")).join("\t"))?;
    }
    Ok(())
  }
}

impl Display for RateMatrix {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let states = (0..self.len()).map(|i| i.to_string()).collect_vec();
    let states = states.iter().map(String::as_str).collect_vec();
    let mut buf = vec![];
    self.print(&mut buf, &states).map_err(|_| std::fmt::Error)?;
    write!(f, "{}", String::from_utf8_lossy(&buf))
  }
}

/// Frequencies must be finite, non-negative and sum to 1 within `FREQS_SUM_TOLERANCE`
pub fn validate_freqs(freqs: &Array1<f64>) -> Result<(), LikelihoodError> {
  if let Some((i, x)) = freqs.iter().find_position(|x| !(x.is_finite() && **x >= 0.0)) {
    return Err(LikelihoodError::invalid_parameter(
      "freqs",
      format!("entry {i} must be finite and non-negative, but found {x}"),
    ));
  }
  let sum = freqs.sum();
  if (sum - 1.0).abs() > FREQS_SUM_TOLERANCE {
    return Err(LikelihoodError::invalid_parameter(
      "freqs",
      format!("frequencies must sum to 1 (within {FREQS_SUM_TOLERANCE:e}), but sum to {sum}"),
    ));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::utils::error::find_likelihood_error;
  use approx::{assert_abs_diff_eq, assert_ulps_eq};
  use rstest::rstest;

  fn ones(n: usize) -> Array2<f64> {
    Array2::ones((n, n))
  }

  #[rstest]
  fn builds_jukes_cantor_generator() -> Result<(), Report> {
    let q = RateMatrix::new(&ones(4), &Array1::from_elem(4, 0.25))?;
    assert_ulps_eq!(q.q()[[0, 1]], 0.25);
    assert_ulps_eq!(q.q()[[2, 2]], -0.75);
    assert_ulps_eq!(q.expected_rate(), 0.75);
    let q = q.normalized()?;
    assert_ulps_eq!(q.expected_rate(), 1.0);
    assert_ulps_eq!(q.q()[[0, 1]], 1.0 / 3.0);
    assert_ulps_eq!(q.scale(), 4.0 / 3.0);
    assert!(q.is_reversible());
    assert!(q.is_valid_generator());
    Ok(())
  }

  #[rstest]
  fn rows_sum_to_zero_with_unequal_freqs() -> Result<(), Report> {
    let r = array![
      [0.0, 1.0, 2.0, 0.5],
      [1.0, 0.0, 0.3, 4.0],
      [2.0, 0.3, 0.0, 1.0],
      [0.5, 4.0, 1.0, 0.0],
    ];
    let q = RateMatrix::with_options(&r, &array![0.1, 0.2, 0.3, 0.4], &ModelOptions::default())?;
    for s in row_sums(&q.q().view()) {
      assert_abs_diff_eq!(s, 0.0, epsilon = 1e-12);
    }
    assert!(q.is_reversible());
    assert_abs_diff_eq!(q.expected_rate(), 1.0, epsilon = 1e-12);
    Ok(())
  }

  #[rstest]
  fn detects_non_reversible_generator() -> Result<(), Report> {
    let r = array![
      [0.0, 1.0, 2.0, 0.5],
      [3.0, 0.0, 0.3, 4.0],
      [2.0, 0.1, 0.0, 1.0],
      [0.5, 4.0, 7.0, 0.0],
    ];
    let q = RateMatrix::new(&r, &array![0.1, 0.2, 0.3, 0.4])?;
    assert!(!q.is_reversible());
    assert!(q.is_valid_generator());
    Ok(())
  }

  #[rstest]
  fn rejects_negative_exchangeability() {
    let mut r = ones(4);
    r[[1, 2]] = -0.1;
    let report = RateMatrix::new(&r, &Array1::from_elem(4, 0.25)).unwrap_err();
    assert!(matches!(
      find_likelihood_error(&report),
      Some(LikelihoodError::InvalidParameter { .. })
    ));
    assert!(report.to_string().contains("(1, 2)"));
  }

  #[rstest]
  #[case(array![0.3, 0.3, 0.3, 0.3])]
  #[case(array![0.5, 0.5, 0.5, -0.5])]
  #[case(array![0.25, 0.25, 0.25, f64::NAN])]
  fn rejects_invalid_freqs(#[case] freqs: Array1<f64>) {
    let report = RateMatrix::new(&ones(4), &freqs).unwrap_err();
    assert!(matches!(
      find_likelihood_error(&report),
      Some(LikelihoodError::InvalidParameter { param, .. }) if param == "freqs"
    ));
  }

  #[rstest]
  fn key_depends_on_entries() -> Result<(), Report> {
    let a = RateMatrix::new(&ones(4), &Array1::from_elem(4, 0.25))?;
    let b = RateMatrix::new(&ones(4), &Array1::from_elem(4, 0.25))?;
    let c = RateMatrix::new(&ones(4), &array![0.1, 0.2, 0.3, 0.4])?;
    assert_eq!(a.key(), b.key());
    assert_ne!(a.key(), c.key());
    Ok(())
  }

  #[rstest]
  fn prints_matrix() -> Result<(), Report> {
    let q = RateMatrix::new(&ones(2), &array![0.5, 0.5])?;
    let mut buf = vec![];
    q.print(&mut buf, &["0", "1"])?;
    let text = String::from_utf8(buf)?;
    assert!(text.contains("0\t-0.5000\t0.5000"), "{text}");
    Ok(())
  }
}

use crate::utils::ndarray::{from_dmatrix, normalize_rows_inplace, row_sums, to_dmatrix};
use ndarray::Array2;

/// `exp(Q * t)` by scaling and squaring with a Padé approximant. Works for any square matrix, reversible or not.
pub fn expm(q: &Array2<f64>, t: f64) -> Array2<f64> {
  let qt = to_dmatrix(&(q * t));
  from_dmatrix(&qt.exp())
}

/// Validates a computed transition matrix and removes round-off: tiny negative entries are set to zero and rows are
/// renormalized to sum to 1.
///
/// Fails with a description of the defect when an entry is not finite, is negative beyond `tolerance`, or when a row
/// sum differs from 1 by more than `tolerance`.
pub fn correct_stochastic(mut p: Array2<f64>, tolerance: f64) -> Result<Array2<f64>, String> {
  if let Some(((i, j), x)) = p.indexed_iter().find(|(_, x)| !x.is_finite()) {
    return Err(format!("entry ({i}, {j}) is not finite: {x}"));
  }
  if let Some(((i, j), x)) = p.indexed_iter().find(|(_, x)| **x < -tolerance) {
    return Err(format!("entry ({i}, {j}) is negative: {x}"));
  }
  p.mapv_inplace(|x| x.clamp(0.0, 1.0 + tolerance));
  if let Some((i, s)) = row_sums(&p.view())
    .iter()
    .enumerate()
    .find(|(_, s)| (*s - 1.0).abs() > tolerance)
  {
    return Err(format!("row {i} sums to {s} instead of 1"));
  }
  normalize_rows_inplace(&mut p);
  Ok(p)
}

use nalgebra::DMatrix;
use ndarray::{Array, Array1, Array2, ArrayView2, Axis, Dimension};

/// Sum of every row
#[inline]
pub fn row_sums(a: &ArrayView2<f64>) -> Array1<f64> {
  a.sum_axis(Axis(1))
}

/// Largest absolute element-wise difference between two arrays of the same shape
pub fn max_abs_diff<D: Dimension>(a: &Array<f64, D>, b: &Array<f64, D>) -> f64 {
  assert_eq!(a.shape(), b.shape());
  a.iter()
    .zip(b.iter())
    .map(|(x, y)| (x - y).abs())
    .fold(0.0, f64::max)
}

/// Divide each row by its sum. Rows summing to zero are left untouched.
pub fn normalize_rows_inplace(a: &mut Array2<f64>) {
  for mut row in a.outer_iter_mut() {
    let sum = row.sum();
    if sum > 0.0 {
      row /= sum;
    }
  }
}

pub fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
  let (n_rows, n_cols) = a.dim();
  DMatrix::from_fn(n_rows, n_cols, |i, j| a[[i, j]])
}

pub fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
  Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_ulps_eq;
  use ndarray::array;
  use rstest::rstest;

  #[rstest]
  fn normalizes_rows_and_skips_empty_ones() {
    let mut a = array![[1.0, 3.0], [0.0, 0.0], [2.0, 2.0]];
    normalize_rows_inplace(&mut a);
    assert_ulps_eq!(a, array![[0.25, 0.75], [0.0, 0.0], [0.5, 0.5]]);
  }

  #[rstest]
  fn converts_to_and_from_nalgebra() {
    let a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
    let m = to_dmatrix(&a);
    assert_eq!((m.nrows(), m.ncols()), (2, 3));
    assert_ulps_eq!(m[(1, 0)], 4.0);
    assert_ulps_eq!(from_dmatrix(&m), a);
  }

  #[rstest]
  fn finds_largest_difference() {
    let a = array![[1.0, 2.0], [3.0, 4.0]];
    let b = array![[1.0, 2.5], [2.0, 4.0]];
    assert_ulps_eq!(max_abs_diff(&a, &b), 1.0);
    assert_ulps_eq!(row_sums(&a.view()), array![3.0, 7.0]);
  }
}

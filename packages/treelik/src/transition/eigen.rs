use crate::model::rate_matrix::RateMatrix;
use crate::utils::ndarray::{from_dmatrix, max_abs_diff, to_dmatrix};
use itertools::Itertools;
use nalgebra::linalg::{Schur, SymmetricEigen};
use nalgebra::{Complex, DMatrix, DVector};
use ndarray::prelude::*;

/// Largest accepted condition number `|V| |V^-1|` of the eigenvector matrix of a general rate matrix
const MAX_CONDITION: f64 = 1e8;

/// Decomposition of a rate matrix reused for every edge length
#[derive(Clone, Debug)]
pub enum Decomposition {
  Reversible(EigenDecomposition),
  General(GeneralEigenDecomposition),
}

impl Decomposition {
  /// Uses the symmetric eigensolver for reversible matrices and the general complex one otherwise. Returns `None`
  /// when neither gives an accurate decomposition, e.g. when Q is not diagonalizable.
  pub fn new(q: &RateMatrix, tolerance: f64) -> Option<Self> {
    EigenDecomposition::reversible(q, tolerance)
      .map(Self::Reversible)
      .or_else(|| GeneralEigenDecomposition::new(q, tolerance).map(Self::General))
  }

  /// `P(t)`, uncorrected
  pub fn transition_matrix(&self, t: f64) -> Array2<f64> {
    match self {
      Self::Reversible(decomposition) => decomposition.transition_matrix(t),
      Self::General(decomposition) => decomposition.transition_matrix(t),
    }
  }
}

/// Eigendecomposition `Q = v * diag(eigvals) * v_inv` of a reversible rate matrix, reused for every edge length
#[derive(Clone, Debug)]
pub struct EigenDecomposition {
  pub eigvals: Array1<f64>,
  pub v: Array2<f64>,
  pub v_inv: Array2<f64>,
}

impl EigenDecomposition {
  /// Decomposes a reversible rate matrix through the symmetric matrix `S = D^(1/2) Q D^(-1/2)`, with `D = diag(pi)`.
  ///
  /// Returns `None` when the matrix is not reversible, when some frequency is not strictly positive, when the
  /// symmetric eigensolver does not converge, or when the reconstruction of Q differs from Q by more than
  /// `tolerance` (relative to the largest rate).
  pub fn reversible(q: &RateMatrix, tolerance: f64) -> Option<Self> {
    let pi = q.freqs();
    if !q.is_reversible() || pi.iter().any(|&p| p <= 0.0) {
      return None;
    }

    let sqrt_pi: Array1<f64> = pi.mapv(f64::sqrt);
    let s = {
      let s = &sqrt_pi.view().insert_axis(Axis(1)) * q.q() / &sqrt_pi.view().insert_axis(Axis(0));
      0.5 * (&s + &s.t())
    };

    let eigen = SymmetricEigen::try_new(to_dmatrix(&s), f64::EPSILON, 0)?;
    let eigvals: Array1<f64> = eigen.eigenvalues.iter().copied().collect();
    let u = from_dmatrix(&eigen.eigenvectors);

    let v = &u / &sqrt_pi.view().insert_axis(Axis(1));
    let v_inv = &u.t() * &sqrt_pi.view().insert_axis(Axis(0));

    let decomposition = Self { eigvals, v, v_inv };

    let max_rate = q.q().iter().fold(1.0_f64, |acc, x| acc.max(x.abs()));
    let reconstructed = decomposition.reconstruct();
    if max_abs_diff(&reconstructed, q.q()) > tolerance * max_rate {
      return None;
    }

    Some(decomposition)
  }

  /// `v * diag(eigvals) * v_inv`
  pub fn reconstruct(&self) -> Array2<f64> {
    (&self.v * &self.eigvals.view().insert_axis(Axis(0))).dot(&self.v_inv)
  }

  /// `P(t) = v * diag(exp(eigvals * t)) * v_inv`, uncorrected
  pub fn transition_matrix(&self, t: f64) -> Array2<f64> {
    let exp_lt = self.eigvals.mapv(|lambda| (lambda * t).exp());
    (&self.v * &exp_lt.view().insert_axis(Axis(0))).dot(&self.v_inv)
  }
}

/// Eigendecomposition `Q = V diag(eigvals) V^-1` of a diagonalizable rate matrix which is not reversible. Eigenvalues
/// and eigenvectors may be complex, the products are real up to rounding.
#[derive(Clone, Debug)]
pub struct GeneralEigenDecomposition {
  eigvals: DVector<Complex<f64>>,
  v: DMatrix<Complex<f64>>,
  v_inv: DMatrix<Complex<f64>>,
}

impl GeneralEigenDecomposition {
  /// Eigenvalues come from the real Schur form. The eigenvector of each eigenvalue `lambda` is the right singular
  /// vector of `Q - lambda I` with the smallest singular value; a repeated eigenvalue takes the next smallest ones.
  ///
  /// Returns `None` when the Schur or singular value decomposition does not converge, when the eigenvector matrix is
  /// singular or ill-conditioned (Q is not diagonalizable), or when the reconstruction of Q differs from Q by more
  /// than `tolerance` (relative to the largest rate).
  pub fn new(q: &RateMatrix, tolerance: f64) -> Option<Self> {
    let m = to_dmatrix(q.q());
    let n = m.nrows();
    let max_rate = m.amax().max(1.0);

    let eigvals = Schur::try_new(m.clone(), f64::EPSILON, 0)?.complex_eigenvalues();
    let mc = m.map(|x| Complex::new(x, 0.0));

    let mut v = DMatrix::<Complex<f64>>::zeros(n, n);
    for (i, &lambda) in eigvals.iter().enumerate() {
      let repeated = eigvals
        .iter()
        .take(i)
        .filter(|&&mu| (mu - lambda).norm() <= tolerance.sqrt() * max_rate)
        .count();
      let shifted = &mc - DMatrix::from_diagonal_element(n, n, lambda);
      let svd = shifted.try_svd(false, true, f64::EPSILON, 0)?;
      let v_t = svd.v_t?;
      let smallest = (0..n)
        .sorted_by(|&a, &b| svd.singular_values[a].total_cmp(&svd.singular_values[b]))
        .nth(repeated)?;
      v.set_column(i, &v_t.row(smallest).adjoint());
    }

    let v_inv = v.clone().try_inverse()?;
    let condition = v.norm() * v_inv.norm();
    if !(condition.is_finite() && condition <= MAX_CONDITION) {
      return None;
    }

    let decomposition = Self { eigvals, v, v_inv };
    if max_abs_diff(&decomposition.reconstruct(), q.q()) > tolerance * max_rate {
      return None;
    }
    Some(decomposition)
  }

  pub fn eigvals(&self) -> &DVector<Complex<f64>> {
    &self.eigvals
  }

  /// Real part of `V diag(eigvals) V^-1`
  pub fn reconstruct(&self) -> Array2<f64> {
    self.real_product(&self.eigvals)
  }

  /// `P(t) = V diag(exp(eigvals * t)) V^-1`, uncorrected
  pub fn transition_matrix(&self, t: f64) -> Array2<f64> {
    self.real_product(&self.eigvals.map(|lambda| (lambda * t).exp()))
  }

  fn real_product(&self, diag: &DVector<Complex<f64>>) -> Array2<f64> {
    let mut scaled = self.v.clone();
    for (mut column, &d) in scaled.column_iter_mut().zip(diag.iter()) {
      column *= d;
    }
    let product = scaled * &self.v_inv;
    Array2::from_shape_fn(product.shape(), |(i, j)| product[(i, j)].re)
  }
}

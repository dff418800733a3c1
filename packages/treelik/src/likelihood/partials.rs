use ndarray::prelude::*;

/// Conditional likelihoods of the data below a node given each state at the node, one row per pattern.
///
/// Rows are rescaled so that their largest entry is 1. The logarithms of the removed factors, accumulated over the
/// subtree, are kept in `log_scale`.
#[derive(Clone, Debug, PartialEq)]
pub struct Partial {
  pub dis: Array2<f64>,
  pub log_scale: Array1<f64>,
}

impl Partial {
  pub fn leaf(profile: &Array2<f64>) -> Self {
    Self {
      dis: profile.clone(),
      log_scale: Array1::zeros(profile.nrows()),
    }
  }

  pub fn n_patterns(&self) -> usize {
    self.dis.nrows()
  }

  /// Message to the parent through an edge with transition matrix `p`: `msg[s] = sum_s' P[s][s'] * dis[s']`
  pub fn message(&self, p: &Array2<f64>) -> Array2<f64> {
    self.dis.dot(&p.t())
  }

  /// Partial of a parent from its children and the transition matrices of the edges above them
  pub fn combine<'a>(
    children: impl IntoIterator<Item = (&'a Partial, &'a Array2<f64>)>,
    shape: (usize, usize),
  ) -> Self {
    let mut dis = Array2::<f64>::ones(shape);
    let mut log_scale = Array1::<f64>::zeros(shape.0);
    for (child, p) in children {
      dis *= &child.message(p);
      log_scale += &child.log_scale;
    }
    let mut partial = Self { dis, log_scale };
    partial.rescale();
    partial
  }

  fn rescale(&mut self) {
    for (mut row, scale) in self.dis.outer_iter_mut().zip(self.log_scale.iter_mut()) {
      let max = row.fold(0.0_f64, |acc, &x| acc.max(x));
      // All-zero rows stay as they are: the pattern is impossible and its log-likelihood is -inf
      if max > 0.0 && max.is_finite() {
        row /= max;
        *scale += max.ln();
      }
    }
  }

  /// Per-pattern log-likelihoods at the root: `ln(sum_s freqs[s] * dis[s]) + log_scale`
  pub fn log_likelihoods(&self, root_freqs: &Array1<f64>) -> Array1<f64> {
    let mut lh = self.dis.dot(root_freqs).mapv(f64::ln);
    lh += &self.log_scale;
    lh
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;
  use rstest::rstest;

  #[rstest]
  fn combines_children_with_rescaling() {
    let a = Partial::leaf(&array![[1.0, 0.0], [0.0, 1.0]]);
    let b = Partial::leaf(&array![[1.0, 0.0], [1.0, 0.0]]);
    let p = array![[0.9, 0.1], [0.2, 0.8]];
    let parent = Partial::combine([(&a, &p), (&b, &p)], (2, 2));

    // Pattern 0: [0.9*0.9, 0.2*0.2] = [0.81, 0.04]; pattern 1: [0.1*0.9, 0.8*0.2] = [0.09, 0.16]
    assert_abs_diff_eq!(parent.dis, array![[1.0, 0.04 / 0.81], [0.09 / 0.16, 1.0]], epsilon = 1e-12);
    assert_abs_diff_eq!(parent.log_scale, array![0.81_f64.ln(), 0.16_f64.ln()], epsilon = 1e-12);

    let freqs = array![0.5, 0.5];
    let lh = parent.log_likelihoods(&freqs);
    assert_abs_diff_eq!(lh[0], (0.5 * 0.81 + 0.5 * 0.04_f64).ln(), epsilon = 1e-12);
    assert_abs_diff_eq!(lh[1], (0.5 * 0.09 + 0.5 * 0.16_f64).ln(), epsilon = 1e-12);
  }

  #[rstest]
  fn keeps_impossible_patterns_at_zero() {
    let a = Partial::leaf(&array![[1.0, 0.0]]);
    let b = Partial::leaf(&array![[0.0, 1.0]]);
    let identity = Array2::<f64>::eye(2);
    let parent = Partial::combine([(&a, &identity), (&b, &identity)], (1, 2));
    assert_abs_diff_eq!(parent.log_scale[0], 0.0);
    assert_eq!(parent.log_likelihoods(&array![0.5, 0.5])[0], f64::NEG_INFINITY);
  }
}

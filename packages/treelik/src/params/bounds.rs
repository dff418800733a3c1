use crate::utils::error::LikelihoodError;
use serde::{Deserialize, Serialize};

/// Lower bound of rate parameters (exchangeabilities, kappa, omega)
pub const RATE_LOWER: f64 = 1e-6;

/// Upper bound of rate parameters
pub const RATE_UPPER: f64 = 1e6;

/// Upper bound of edge lengths
pub const LENGTH_UPPER: f64 = 10.0;

/// Smallest value of a frequency after projection onto the simplex
pub const FREQ_FLOOR: f64 = 1e-6;

/// Closed interval of admissible values of a scalar parameter
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
  pub lower: f64,
  pub upper: f64,
}

impl Bounds {
  pub fn new(lower: f64, upper: f64) -> Result<Self, LikelihoodError> {
    if lower.is_nan() || upper.is_nan() || lower > upper {
      return Err(LikelihoodError::invalid_parameter(
        "bounds",
        format!("lower bound {lower} must not exceed upper bound {upper}"),
      ));
    }
    Ok(Self { lower, upper })
  }

  pub const fn rate() -> Self {
    Self {
      lower: RATE_LOWER,
      upper: RATE_UPPER,
    }
  }

  pub const fn length() -> Self {
    Self {
      lower: 0.0,
      upper: LENGTH_UPPER,
    }
  }

  /// Bounds of each component of a frequency vector
  pub const fn unit() -> Self {
    Self { lower: 0.0, upper: 1.0 }
  }

  pub fn contains(&self, x: f64) -> bool {
    x >= self.lower && x <= self.upper
  }

  pub fn clamp(&self, x: f64) -> f64 {
    if x.is_nan() {
      self.lower
    } else {
      x.clamp(self.lower, self.upper)
    }
  }

  /// Whether a search in log space is possible, i.e. the interval is strictly positive
  pub fn is_positive(&self) -> bool {
    self.lower > 0.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_ulps_eq;
  use rstest::rstest;

  #[rstest]
  fn clamps_into_interval() {
    let bounds = Bounds::length();
    assert_ulps_eq!(bounds.clamp(-0.1), 0.0);
    assert_ulps_eq!(bounds.clamp(11.0), 10.0);
    assert_ulps_eq!(bounds.clamp(f64::NAN), 0.0);
    assert!(bounds.contains(0.0));
    assert!(!bounds.is_positive());
    assert!(Bounds::rate().is_positive());
  }

  #[rstest]
  fn rejects_inverted_interval() {
    assert!(Bounds::new(1.0, 0.5).is_err());
    assert!(Bounds::new(0.5, 0.5).is_ok());
  }
}

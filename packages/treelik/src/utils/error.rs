#![allow(clippy::pub_use)]

use eyre::Report;
use itertools::Itertools;
use thiserror::Error;

/// Failure kinds of model construction, likelihood evaluation and fitting.
///
/// These are carried inside `eyre::Report`s and can be recovered with `report.downcast_ref::<LikelihoodError>()`.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum LikelihoodError {
  #[error("Invalid parameter '{param}'{}: {reason}", fmt_edge(.edge))]
  InvalidParameter {
    param: String,
    edge: Option<String>,
    reason: String,
  },

  #[error(
    "Tree tips do not match alignment taxa. Tips missing from the alignment: [{}]. Taxa missing from the tree: [{}]",
    join_names(.missing_in_alignment),
    join_names(.missing_in_tree)
  )]
  InconsistentTopology {
    missing_in_alignment: Vec<String>,
    missing_in_tree: Vec<String>,
  },

  #[error("Unable to compute transition probabilities{} for length {length}: {reason}", fmt_edge(.edge))]
  SingularRateMatrix {
    edge: Option<String>,
    length: f64,
    reason: String,
  },

  #[error(
    "Optimizer did not converge after {iterations} iterations: last improvement {improvement:e} exceeds tolerance {tolerance:e}"
  )]
  DidNotConverge {
    iterations: usize,
    improvement: f64,
    tolerance: f64,
  },

  #[error("Optimization failed while updating '{param}': {reason}")]
  OptimizationFailed { param: String, reason: String },
}

fn join_names(names: &[String]) -> String {
  names.iter().join(", ")
}

fn fmt_edge(edge: &Option<String>) -> String {
  match edge {
    Some(edge) => format!(" on edge '{edge}'"),
    None => String::new(),
  }
}

impl LikelihoodError {
  pub fn invalid_parameter(param: impl AsRef<str>, reason: impl AsRef<str>) -> Self {
    Self::InvalidParameter {
      param: param.as_ref().to_owned(),
      edge: None,
      reason: reason.as_ref().to_owned(),
    }
  }

  /// Attach the name of the edge on which the failure occurred, when the error kind carries one
  #[must_use]
  pub fn on_edge(self, edge_name: impl AsRef<str>) -> Self {
    let edge_name = Some(edge_name.as_ref().to_owned());
    match self {
      Self::InvalidParameter { param, reason, .. } => Self::InvalidParameter {
        param,
        edge: edge_name,
        reason,
      },
      Self::SingularRateMatrix { length, reason, .. } => Self::SingularRateMatrix {
        edge: edge_name,
        length,
        reason,
      },
      other => other,
    }
  }

  /// Whether an evaluation that failed with this error is worth retrying with projected parameters
  pub const fn is_numerical(&self) -> bool {
    matches!(self, Self::SingularRateMatrix { .. })
  }
}

/// Finds a `LikelihoodError` anywhere in the report's chain
pub fn find_likelihood_error(report: &Report) -> Option<&LikelihoodError> {
  report.chain().find_map(|cause| cause.downcast_ref::<LikelihoodError>())
}

pub fn report_to_string(report: &Report) -> String {
  let strings: Vec<String> = report.chain().map(std::string::ToString::to_string).collect();
  strings.join(": ")
}

#[macro_export(local_inner_macros)]
macro_rules! make_error {
  ($($arg:tt)*) => {
    {
      Err(eyre::eyre!(std::format!($($arg)*)))
    }
  };
}

pub use make_error;

#[macro_export(local_inner_macros)]
macro_rules! make_report {
  ($($arg:tt)*) => {
    {
      eyre::eyre!($($arg)*)
    }
  };
}

pub use make_report;

#[macro_export(local_inner_macros)]
macro_rules! make_internal_error {
  ($($arg:tt)*) => {
    {
      let msg_external = std::format!($($arg)*);
      let msg = std::format!("{msg_external}. This is an internal error. Please report it to developers.");
      Err(eyre::eyre!(msg))
    }
  };
}

pub use make_internal_error;

#[macro_export(local_inner_macros)]
macro_rules! make_internal_report {
  ($($arg:tt)*) => {
    {
      let msg_external = std::format!($($arg)*);
      let msg = std::format!("{msg_external}. This is an internal error. Please report it to developers.");
      eyre::eyre!(msg)
    }
  };
}

pub use make_internal_report;

#[cfg(test)]
mod tests {
  use super::*;
  use eyre::WrapErr;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  fn names_the_edge_in_message() {
    let err = LikelihoodError::invalid_parameter("length", "must not be negative, but found -0.5").on_edge("edge.3");
    assert_eq!(
      err.to_string(),
      "Invalid parameter 'length' on edge 'edge.3': must not be negative, but found -0.5"
    );
  }

  #[rstest]
  fn lists_mismatched_names() {
    let err = LikelihoodError::InconsistentTopology {
      missing_in_alignment: vec!["A".to_owned()],
      missing_in_tree: vec!["X".to_owned(), "Y".to_owned()],
    };
    assert_eq!(
      err.to_string(),
      "Tree tips do not match alignment taxa. Tips missing from the alignment: [A]. Taxa missing from the tree: [X, Y]"
    );
  }

  #[rstest]
  fn finds_error_through_context() {
    let report: Report = Err::<(), _>(LikelihoodError::invalid_parameter("kappa", "is NaN"))
      .wrap_err("When building rate matrix")
      .unwrap_err();
    assert_eq!(
      find_likelihood_error(&report),
      Some(&LikelihoodError::invalid_parameter("kappa", "is NaN"))
    );
    assert_eq!(
      report_to_string(&report),
      "When building rate matrix: Invalid parameter 'kappa': is NaN"
    );
  }
}

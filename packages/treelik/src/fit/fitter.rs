use crate::fit::minimize_scalar::minimize_scalar_brent_bounded;
use crate::fit::nelder_mead::minimize_nelder_mead;
use crate::io::json::{json_read_file, json_write_file, JsonPretty};
use crate::likelihood::likelihood_function::LikelihoodFunction;
use crate::params::bounds::Bounds;
use crate::params::parameter_set::{project_simplex, GroupRef, ParamGroup, ParamValue, ParameterSet};
use crate::utils::error::{find_likelihood_error, report_to_string, LikelihoodError};
use eyre::{Report, WrapErr};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::cell::RefCell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strum_macros::Display;

/// Absolute tolerance of Brent searches, in the search coordinate (log of the value for positive bounds)
const BRENT_TOLERANCE: f64 = 1e-8;

/// Initial displacement of the Nelder-Mead simplex around the current frequencies
const SIMPLEX_STEP: f64 = 0.05;

const SIMPLEX_SD_TOLERANCE: f64 = 1e-12;

#[derive(Copy, Clone, Debug, PartialEq, SmartDefault, Serialize, Deserialize)]
pub struct FitOptions {
  /// The fit converges when one sweep over all free groups improves the log-likelihood by less than this
  #[default = 1e-6]
  pub tolerance: f64,

  /// Maximum number of sweeps over all free groups
  #[default = 100]
  pub max_iter: usize,

  /// Maximum number of iterations of every Brent search
  #[default = 100]
  pub brent_max_iter: u64,

  /// Maximum number of iterations of every Nelder-Mead search
  #[default = 200]
  pub nelder_mead_max_iter: u64,

  /// Retry once with parameters projected into their feasible region when evaluation fails numerically
  #[default = true]
  pub retry: bool,
}

/// Stage of a fit. `Converged`, `MaxIterReached`, `Failed` and `Cancelled` are final.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitState {
  Initialized,
  Evaluating,
  Converged,
  MaxIterReached,
  Failed,
  Cancelled,
}

impl FitState {
  pub const fn is_final(self) -> bool {
    !matches!(self, Self::Initialized | Self::Evaluating)
  }
}

/// Requests a running fit to stop. Checked between parameter updates; the fit then returns the best parameters found
/// so far.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
  pub params: ParameterSet,
  pub log_likelihood: f64,
  pub status: FitState,
  /// Completed sweeps over the free groups
  pub iterations: usize,
  /// Likelihood evaluations performed by the fit
  pub evaluations: usize,
  /// Set to `DidNotConverge` when the iteration budget ran out
  #[serde(skip)]
  pub warning: Option<LikelihoodError>,
  pub n_free_params: usize,
  /// Number of sites, the sample size of the BIC
  pub n_sites: f64,
  pub aic: f64,
  pub bic: f64,
}

impl FitResult {
  /// Writes the result as pretty JSON. The non-convergence warning is not written.
  pub fn save_json(&self, filepath: impl AsRef<Path>) -> Result<(), Report> {
    json_write_file(filepath, self, JsonPretty(true)).wrap_err("When saving fit result")
  }

  pub fn load_json(filepath: impl AsRef<Path>) -> Result<Self, Report> {
    json_read_file(filepath).wrap_err("When loading fit result")
  }
}

/// Outcome of a search over the values of one group
struct Search {
  value: ParamValue,
  /// Negative log-likelihood at `value`, `+inf` when no evaluation succeeded
  cost: f64,
  /// Last failed evaluation, if any
  failure: Option<String>,
}

/// Maximizes the log-likelihood over the free parameter groups by cyclic block coordinate ascent.
///
/// Each sweep visits every free group in parameter order. Scalar groups are searched with Brent's method, in log space
/// when their bounds are strictly positive. Frequency groups are searched with Nelder-Mead over the first K - 1
/// components, projected onto the simplex. The best value of a search is kept only if it does not decrease the
/// log-likelihood.
#[derive(Debug)]
pub struct Fitter {
  lf: LikelihoodFunction,
  options: FitOptions,
  state: FitState,
  token: CancellationToken,
}

impl Fitter {
  pub fn new(lf: LikelihoodFunction, options: FitOptions) -> Self {
    Self {
      lf,
      options,
      state: FitState::Initialized,
      token: CancellationToken::new(),
    }
  }

  #[must_use]
  pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
    self.token = token;
    self
  }

  pub fn cancellation_token(&self) -> CancellationToken {
    self.token.clone()
  }

  pub const fn state(&self) -> FitState {
    self.state
  }

  pub const fn options(&self) -> &FitOptions {
    &self.options
  }

  /// Likelihood function holding the current (after a fit: the fitted) parameters
  pub const fn likelihood_function(&self) -> &LikelihoodFunction {
    &self.lf
  }

  pub fn into_likelihood_function(self) -> LikelihoodFunction {
    self.lf
  }

  pub fn run(&mut self) -> Result<FitResult, Report> {
    self.state = FitState::Evaluating;
    match self.ascend() {
      Ok(result) => {
        self.state = result.status;
        Ok(result)
      }
      Err(report) => {
        self.state = FitState::Failed;
        Err(report)
      }
    }
  }

  fn ascend(&mut self) -> Result<FitResult, Report> {
    let evaluations_before = self.lf.n_evaluations();
    let mut lnl = self.evaluate_start().wrap_err("When evaluating the initial parameters")?;
    debug!(
      "Fitting {} free parameters in {} groups, initial log-likelihood {lnl:.6}",
      self.lf.params().n_free_params(),
      self.lf.params().free_groups().len()
    );

    let mut iterations = 0;
    let mut improvement = f64::INFINITY;
    let status = loop {
      if self.token.is_cancelled() {
        break FitState::Cancelled;
      }
      if iterations >= self.options.max_iter {
        break FitState::MaxIterReached;
      }

      let before = lnl;
      for gref in self.lf.params().free_groups() {
        if self.token.is_cancelled() {
          break;
        }
        lnl = self
          .update_group(&gref, lnl)
          .wrap_err_with(|| format!("When optimizing parameter '{}'", gref.param))?;
      }
      iterations += 1;
      improvement = lnl - before;
      debug!("Iteration {iterations}: log-likelihood {lnl:.6}, improvement {improvement:.3e}");

      if self.token.is_cancelled() {
        break FitState::Cancelled;
      }
      if improvement < self.options.tolerance {
        break FitState::Converged;
      }
    };

    let warning = (status == FitState::MaxIterReached).then(|| {
      let warning = LikelihoodError::DidNotConverge {
        iterations,
        improvement,
        tolerance: self.options.tolerance,
      };
      warn!("{warning}. Returning the best parameters found.");
      warning
    });

    info!("Fit finished with status '{status}' after {iterations} iterations, log-likelihood {lnl:.6}");

    let params = self.lf.params().clone();
    let n_free_params = params.n_free_params();
    let n_sites = self.lf.patterns().n_sites();
    let k = n_free_params as f64;
    Ok(FitResult {
      params,
      log_likelihood: lnl,
      status,
      iterations,
      evaluations: self.lf.n_evaluations() - evaluations_before,
      warning,
      n_free_params,
      n_sites,
      aic: 2.0 * k - 2.0 * lnl,
      bic: k * n_sites.ln() - 2.0 * lnl,
    })
  }

  /// Log-likelihood at the starting parameters, retried once with projected parameters
  fn evaluate_start(&mut self) -> Result<f64, Report> {
    let reason = match self.lf.log_likelihood() {
      Ok(lnl) if lnl.is_finite() => return Ok(lnl),
      Ok(lnl) => format!("log-likelihood is {lnl}"),
      Err(report) if is_numerical(&report) => report_to_string(&report),
      Err(report) => return Err(report),
    };
    if !self.options.retry {
      return Err(optimization_failed("initial parameters", reason));
    }

    warn!("Evaluation at the initial parameters failed ({reason}). Retrying with projected parameters.");
    self.project()?;
    match self.lf.log_likelihood() {
      Ok(lnl) if lnl.is_finite() => Ok(lnl),
      Ok(lnl) => Err(optimization_failed("initial parameters", format!("log-likelihood is {lnl}"))),
      Err(report) => Err(optimization_failed("initial parameters", report_to_string(&report))),
    }
  }

  /// Searches the values of one group and keeps the best one if it does not decrease the log-likelihood. Returns the
  /// log-likelihood at the resulting parameters.
  fn update_group(&mut self, gref: &GroupRef, mut lnl: f64) -> Result<f64, Report> {
    let mut group = self.lf.params().group(gref)?.clone();
    let mut search = self.search(gref, &group)?;

    if !search.cost.is_finite() && self.options.retry {
      warn!(
        "No finite log-likelihood found for '{}' ({}): {}. Retrying with projected parameters.",
        gref.param,
        group.scope(),
        search.failure.as_deref().unwrap_or("unknown reason")
      );
      self.project()?;
      lnl = self.lf.log_likelihood().ok().filter(|x| x.is_finite()).unwrap_or(f64::NEG_INFINITY);
      group = self.lf.params().group(gref)?.clone();
      search = self.search(gref, &group)?;
    }

    if !search.cost.is_finite() {
      let reason = search
        .failure
        .unwrap_or_else(|| "log-likelihood is not finite anywhere in the search".to_owned());
      return Err(optimization_failed(format!("{} ({})", gref.param, group.scope()), reason));
    }

    self.lf.set_group_value(&gref.param, gref.group, search.value.clone())?;
    match self.lf.log_likelihood() {
      Ok(candidate) if candidate >= lnl => {
        trace!(
          "Accepted {} ({}) = {}: log-likelihood {lnl:.9} -> {candidate:.9}",
          gref.param,
          group.scope(),
          search.value
        );
        Ok(candidate)
      }
      _ => {
        self.lf.set_group_value(&gref.param, gref.group, group.value)?;
        Ok(lnl)
      }
    }
  }

  fn search(&mut self, gref: &GroupRef, group: &ParamGroup) -> Result<Search, Report> {
    match &group.value {
      ParamValue::Scalar(x) => self.search_scalar(gref, &group.bounds, *x),
      ParamValue::Simplex(v) => self.search_simplex(gref, v),
    }
  }

  fn search_scalar(&mut self, gref: &GroupRef, bounds: &Bounds, current: f64) -> Result<Search, Report> {
    if bounds.lower >= bounds.upper {
      return Ok(Search {
        value: ParamValue::Scalar(current),
        cost: -self.lf.log_likelihood()?,
        failure: None,
      });
    }

    let log_scale = bounds.is_positive();
    let to_value = |u: f64| bounds.clamp(if log_scale { u.exp() } else { u });
    let interval = if log_scale {
      (bounds.lower.ln(), bounds.upper.ln())
    } else {
      (bounds.lower, bounds.upper)
    };

    let lf = RefCell::new(&mut self.lf);
    let failure = RefCell::new(None);
    let cost = |u: f64| {
      let mut lf = lf.borrow_mut();
      negative_log_likelihood(&mut lf, gref, ParamValue::Scalar(to_value(u)), &failure)
    };
    let (u, cost) = minimize_scalar_brent_bounded(cost, interval, BRENT_TOLERANCE, self.options.brent_max_iter)?;

    Ok(Search {
      value: ParamValue::Scalar(to_value(u)),
      cost,
      failure: failure.into_inner(),
    })
  }

  fn search_simplex(&mut self, gref: &GroupRef, current: &[f64]) -> Result<Search, Report> {
    // The last component is determined by the others
    let to_value = |x: &[f64]| {
      let mut full = x.to_vec();
      full.push(1.0 - x.iter().sum::<f64>());
      project_simplex(&full)
    };
    let initial = &current[..current.len().saturating_sub(1)];

    let lf = RefCell::new(&mut self.lf);
    let failure = RefCell::new(None);
    let cost = |x: &[f64]| {
      let mut lf = lf.borrow_mut();
      negative_log_likelihood(&mut lf, gref, ParamValue::Simplex(to_value(x)), &failure)
    };
    let (x, cost) = minimize_nelder_mead(
      cost,
      initial,
      SIMPLEX_STEP,
      SIMPLEX_SD_TOLERANCE,
      self.options.nelder_mead_max_iter,
    )?;

    Ok(Search {
      value: ParamValue::Simplex(to_value(&x)),
      cost,
      failure: failure.into_inner(),
    })
  }

  fn project(&mut self) -> Result<(), Report> {
    let mut params = self.lf.params().clone();
    params.project();
    self.lf.set_params(params)
  }
}

/// Cost of a candidate value of one group. Failed or non-finite evaluations cost `+inf` and are remembered.
fn negative_log_likelihood(
  lf: &mut LikelihoodFunction,
  gref: &GroupRef,
  value: ParamValue,
  failure: &RefCell<Option<String>>,
) -> f64 {
  let lnl = lf
    .set_group_value(&gref.param, gref.group, value)
    .and_then(|()| lf.log_likelihood());
  match lnl {
    Ok(lnl) if lnl.is_finite() => -lnl,
    Ok(lnl) => {
      *failure.borrow_mut() = Some(format!("log-likelihood is {lnl}"));
      f64::INFINITY
    }
    Err(report) => {
      *failure.borrow_mut() = Some(report_to_string(&report));
      f64::INFINITY
    }
  }
}

fn is_numerical(report: &Report) -> bool {
  find_likelihood_error(report).is_some_and(LikelihoodError::is_numerical)
}

fn optimization_failed(param: impl AsRef<str>, reason: impl AsRef<str>) -> Report {
  Report::new(LikelihoodError::OptimizationFailed {
    param: param.as_ref().to_owned(),
    reason: reason.as_ref().to_owned(),
  })
}

use crate::make_report;
use argmin::core::{CostFunction, Error, Executor, State};
use argmin::solver::brent::BrentOpt;
use eyre::Report;

struct CostFunctionWrapper<F>
where
  F: Fn(f64) -> f64,
{
  problem: F,
}

impl<F> CostFunctionWrapper<F>
where
  F: Fn(f64) -> f64,
{
  pub const fn new(problem: F) -> Self {
    Self { problem }
  }
}

impl<F> CostFunction for CostFunctionWrapper<F>
where
  F: Fn(f64) -> f64,
{
  type Param = f64;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> Result<Self::Output, Error> {
    let problem = &self.problem;
    Ok(problem(*x))
  }
}

/// Minimizes a function of one variable on a closed interval with Brent's method.
///
/// Returns the best argument and the function value there. `tolerance` is the absolute part of the termination
/// criterion on the argument.
pub fn minimize_scalar_brent_bounded(
  problem: impl Fn(f64) -> f64,
  bounds: (f64, f64),
  tolerance: f64,
  max_iters: u64,
) -> Result<(f64, f64), Report> {
  let problem = CostFunctionWrapper::new(problem);
  let solver = BrentOpt::new(bounds.0, bounds.1).set_tolerance(f64::EPSILON.sqrt(), tolerance);

  let result = Executor::new(problem, solver)
    .configure(|state| state.max_iters(max_iters))
    .run()
    .map_err(|err| make_report!("{err}"))?;

  let param = *result
    .state()
    .get_best_param()
    .ok_or_else(|| make_report!("Unable to get the best param"))?;

  let cost = result.state().get_best_cost();

  Ok((param, cost))
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;
  use rstest::rstest;

  #[rstest]
  fn finds_minimum_of_parabola() -> Result<(), Report> {
    let (x, cost) = minimize_scalar_brent_bounded(|x| (x - 0.3).powi(2) + 1.0, (0.0, 2.0), 1e-10, 100)?;
    assert_abs_diff_eq!(x, 0.3, epsilon = 1e-6);
    assert_abs_diff_eq!(cost, 1.0, epsilon = 1e-10);
    Ok(())
  }

  #[rstest]
  fn stays_within_bounds() -> Result<(), Report> {
    let (x, _) = minimize_scalar_brent_bounded(|x| -x, (1.0, 2.0), 1e-10, 100)?;
    assert!((1.0..=2.0).contains(&x));
    assert_abs_diff_eq!(x, 2.0, epsilon = 1e-4);
    Ok(())
  }
}

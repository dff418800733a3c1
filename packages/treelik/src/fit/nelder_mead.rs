use crate::make_report;
use argmin::core::{CostFunction, Error, Executor, State};
use argmin::solver::neldermead::NelderMead;
use eyre::Report;

struct CostFunctionWrapper<F>
where
  F: Fn(&[f64]) -> f64,
{
  problem: F,
}

impl<F> CostFunction for CostFunctionWrapper<F>
where
  F: Fn(&[f64]) -> f64,
{
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> Result<Self::Output, Error> {
    let problem = &self.problem;
    Ok(problem(x))
  }
}

/// Minimizes a function of several variables with the Nelder-Mead simplex method, starting from the simplex formed
/// by `initial` and its displacements by `step` along every axis.
///
/// Returns the best argument and the function value there.
pub fn minimize_nelder_mead(
  problem: impl Fn(&[f64]) -> f64,
  initial: &[f64],
  step: f64,
  sd_tolerance: f64,
  max_iters: u64,
) -> Result<(Vec<f64>, f64), Report> {
  let mut simplex = vec![initial.to_vec()];
  for i in 0..initial.len() {
    let mut vertex = initial.to_vec();
    vertex[i] += step;
    simplex.push(vertex);
  }

  let solver = NelderMead::new(simplex)
    .with_sd_tolerance(sd_tolerance)
    .map_err(|err| make_report!("{err}"))?;

  let result = Executor::new(CostFunctionWrapper { problem }, solver)
    .configure(|state| state.max_iters(max_iters))
    .run()
    .map_err(|err| make_report!("{err}"))?;

  let param = result
    .state()
    .get_best_param()
    .cloned()
    .ok_or_else(|| make_report!("Unable to get the best param"))?;

  let cost = result.state().get_best_cost();

  Ok((param, cost))
}

pub mod fitter;
pub mod minimize_scalar;
pub mod nelder_mead;

pub mod likelihood_function;
pub mod partials;

pub mod model_family;
pub mod rate_matrix;

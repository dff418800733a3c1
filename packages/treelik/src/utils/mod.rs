pub mod error;
pub mod global_init;
pub mod ndarray;
pub mod random;
pub mod string;

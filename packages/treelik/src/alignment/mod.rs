pub mod alignment;
pub mod patterns;

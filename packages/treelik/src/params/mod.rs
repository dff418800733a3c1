pub mod bounds;
pub mod parameter_set;
pub mod rule;

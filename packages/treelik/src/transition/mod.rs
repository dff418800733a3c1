pub mod eigen;
pub mod expm;
pub mod provider;

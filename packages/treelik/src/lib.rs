pub mod alignment;
pub mod alphabet;
pub mod distance;
pub mod fit;
pub mod io;
pub mod likelihood;
pub mod model;
pub mod params;
pub mod process;
pub mod simulate;
pub mod transition;
pub mod tree;
pub mod utils;

pub mod newick;
pub mod reroot;
pub mod tree;

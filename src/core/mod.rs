pub mod descriptor;
pub mod key;
pub mod tree;

pub use descriptor::*;
pub use key::*;
pub use tree::{HierarchicalRecord, Leaf, L2Map, L3Map, Page, Tree, Value};

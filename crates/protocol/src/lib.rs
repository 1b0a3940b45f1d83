pub mod shared_str;
pub mod tree;

pub use shared_str::{Interner, SharedStr};
pub use tree::{NodeSnapshot, SourceFormat, TreeModel, TreeSnapshot, ValueUnit, snapshot};

pub mod call_graph;
pub mod location;
pub mod memory;
pub mod session;
pub mod stack_tree;

pub use call_graph::{
    CallEdge, CallGraph, CallGraphError, CallNode, CallStats, FileId, FileRecord, FileTable,
    FunctionId, FunctionRecord, FunctionTable,
};
pub use location::{LocationGroup, LocationNode, LocationTree};
pub use memory::{
    Address, AddressAllocator, MemoryNode, MemoryTree, RawRecord, RecordKind, ReducedRecord,
    TypeSummary,
};
pub use session::{Dataset, DatasetEntry, Session, ViewKind};
pub use stack_tree::{Frame, StackError, StackFrame, StackNodeId, StackProfiles, StackTree};

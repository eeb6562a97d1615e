//! Node executions: the per-attempt record, its status machine, and the store
//! that owns every write to it.

pub mod node_execution;
pub mod status;
pub mod store;

pub use node_execution::{
    AdviseRecord, ChildRef, Conclusion, ErrorClass, ExecutableResponse, ExecutionMode, FailureInfo,
    FailureType, InterruptEffect, NodeExecution, ProgressEntry,
};
pub use status::Status;
pub use store::{NodeExecutionStore, Transition};

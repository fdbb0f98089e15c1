//! Workflow data model.
//!
//! Type definitions shared by the store, the runtime, and the HTTP API:
//! - Workflow / Node / Edge as persisted by the editor
//! - Execution rows and their status lifecycle
//! - ExecutionProgress snapshots broadcast while a run is in flight

pub mod types;

pub use types::{
    Credential, Edge, Execution, ExecutionData, ExecutionProgress, ExecutionStatus, Node,
    NodeKind, NodeProgress, NodeStatus, Workflow,
};

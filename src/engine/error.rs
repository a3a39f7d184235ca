//! Engine error types
//!
//! Only structural problems surface as errors. Node failures are encoded in
//! [`ExecutionResult`](super::result::ExecutionResult) and never thrown.

use crate::workflow::{LoadError, SettingsError};

/// Errors that stop a run before (or instead of) scheduling
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("No start node found in workflow '{0}'")]
    NoStartNode(String),

    #[error("Target node not found: {0}")]
    TargetNotFound(String),

    #[error("Target node '{0}' is not reachable from any start node")]
    TargetUnreachable(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Unknown node type '{node_type}' for node '{node_id}'")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("Connection references unknown node '{node}'")]
    DanglingConnection { node: String },

    #[error("Failed to construct node '{node_id}': {message}")]
    TaskConstruction { node_id: String, message: String },

    #[error("Execution task failed: {0}")]
    TaskJoin(String),
}

//! Workflow types and definitions
//!
//! This module contains all types for defining and parsing workflow graphs:
//! - `definition` - Nodes, ports and connections as written in a graph file
//! - `context` - ExecutionContext for runtime state
//! - `expressions` - Template substitution for `{{ }}` syntax and conditions
//! - `loader` - Load workflows from files and directories
//! - `settings` - Per-run execution settings

pub mod context;
pub mod definition;
pub mod expressions;
pub mod loader;
pub mod settings;

// Re-export all public types for convenience
pub use context::{
    CapturedError, ExecutionContext, PauseSignal, ResourceHandle, VariableMap, Variables,
};
pub use definition::{
    ConnectionDefinition, DataType, NodeDefinition, PortDefinition, PortKind, WorkflowDefinition,
};
pub use expressions::{evaluate_condition, render, resolve_value, ExpressionError, ValueLookup};
pub use loader::{LoadError, WorkflowLoader};
pub use settings::{ExecutionSettings, SettingsError};

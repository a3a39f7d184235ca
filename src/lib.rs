//! # Nodeflow
//!
//! A graph workflow execution engine: typed, stateful nodes connected by
//! execution and data ports, driven to completion by a queue-based scheduler.
//!
//! ## Features
//!
//! - **Declarative YAML/JSON graphs** - Nodes, ports and connections in one file
//! - **Control flow** - if/switch branching, for/while loops with break/continue
//! - **Error routing** - try/catch scopes, continue-on-error
//! - **Concurrency** - fork/join branches and batched parallel foreach
//! - **Run control** - pause/resume, stop, "run to node" and single-node runs
//! - **Templates** - `{{variable}}` and `{{node_id.port}}` substitution
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nodeflow::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let workflow_yaml = r#"
//! name: greet
//! variables:
//!   user: ada
//! nodes:
//!   - id: start
//!     type: start
//!   - id: hello
//!     type: log
//!     config:
//!       message: "Hello {{user}}"
//!   - id: end
//!     type: end
//! connections:
//!   - { from: start.exec_out, to: hello.exec_in }
//!   - { from: hello.exec_out, to: end.exec_in }
//! "#;
//!
//!     let definition = WorkflowLoader::from_yaml(workflow_yaml)?;
//!     let bus = Arc::new(EventBus::new());
//!     let mut executor =
//!         WorkflowExecutor::from_definition(&definition, &TaskRegistry::with_builtins(), bus)?;
//!
//!     let summary = executor.run(false).await?;
//!     println!("Workflow completed: success={}", summary.success);
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod workflow;

// Re-export main types
pub use engine::{
    EngineError, EventBus, EventSubscriber, EventType, ExecutionResult, NodeInvocation, RunState,
    RunSummary, TaskBody, TaskRegistry, WorkflowEvent, WorkflowExecutor, WorkflowGraph,
};
pub use workflow::{
    ExecutionContext, ExecutionSettings, LoadError, NodeDefinition, PauseSignal, ResourceHandle,
    WorkflowDefinition, WorkflowLoader,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::engine::{
        ChannelSubscriber, EngineError, EventBus, EventSubscriber, EventType, ExecutionResult,
        NodeCategory, NodeInvocation, RunState, RunSummary, TaskBody, TaskRegistry, WorkflowEvent,
        WorkflowExecutor, WorkflowGraph,
    };
    pub use crate::workflow::{
        DataType, ExecutionContext, ExecutionSettings, LoadError, NodeDefinition, PauseSignal,
        PortDefinition, ResourceHandle, WorkflowDefinition, WorkflowLoader,
    };
}

//! Workflow execution engine module
//!
//! This module contains:
//! - `executor` - The public workflow executor
//! - `graph` - Compiled graph model and structural queries
//! - `scheduler` - The queue-driven scheduling loop
//! - `orchestrator` - Routing decisions for special results
//! - `parallel` - Fork/join and parallel foreach sub-executions
//! - `state_manager` - Run lifecycle, executed set, pause/stop gating
//! - `node_executor` - Runs a single task body under a deadline
//! - `variable_resolver` - Data-port wiring and config templates
//! - `registry` - Task-body trait and factory keyed by type tag
//! - `tasks` - Built-in control-flow task bodies
//! - `events` - Lifecycle events and the event bus
//! - `error` / `result` - Error and result types

pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod node_executor;
pub mod orchestrator;
pub(crate) mod parallel;
pub mod registry;
pub mod result;
pub(crate) mod scheduler;
pub mod state_manager;
pub mod tasks;
pub mod variable_resolver;

pub use error::EngineError;
pub use events::{ChannelSubscriber, EventBus, EventSubscriber, EventType, SubscriptionId, WorkflowEvent};
pub use executor::WorkflowExecutor;
pub use graph::{GraphNode, NodeCategory, WorkflowGraph};
pub use registry::{NodeInvocation, TaskBody, TaskFactory, TaskRegistry};
pub use result::{ExecutionResult, ForeachBatch, ParallelBranches, RunSummary};
pub use state_manager::{ExecutionStateManager, RunState, StopSignal};
pub use variable_resolver::PortValues;

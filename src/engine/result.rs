//! Execution result types

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::state_manager::RunState;
use crate::workflow::VariableMap;

/// Fork request produced by a `fork` node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParallelBranches {
    pub fork_node_id: String,
    /// Exec output ports of the fork, one per branch
    pub branches: Vec<String>,
    /// Paired join; resolved from the graph when `None`
    pub join_node_id: Option<String>,
    /// Failure policy; the run setting applies when `None`
    pub fail_fast: Option<bool>,
}

/// One batch of a parallel foreach
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForeachBatch {
    pub node_id: String,
    /// Remaining items; the scheduler runs the first `batch_size` of them
    pub items: Vec<Value>,
    /// Index of `items[0]` in the full item list
    pub start_index: usize,
    /// Exec output port whose chain is run once per item
    pub body_port: String,
    /// Variable holding the `{results, errors}` accumulators
    pub results_var: String,
    /// Items per batch; the run setting applies when `None`
    pub batch_size: Option<usize>,
    /// Per-item deadline; the run setting applies when `None`
    pub item_timeout: Option<Duration>,
}

/// Result of a single task-body invocation
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub data: HashMap<String, Value>,
    pub error: Option<String>,
    /// Explicit output ports that fired
    pub next_nodes: Option<Vec<String>>,

    // Driver-only routing instructions
    pub loop_back_to: Option<String>,
    pub route_to_catch: Option<String>,
    pub error_captured: bool,
    pub parallel_branches: Option<ParallelBranches>,
    pub parallel_foreach_batch: Option<ForeachBatch>,
}

impl ExecutionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        let mut data = HashMap::new();
        data.insert("error".to_string(), Value::String(error.clone()));
        Self {
            success: false,
            data,
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Fire exactly these output ports
    pub fn with_next(mut self, ports: &[&str]) -> Self {
        self.next_nodes = Some(ports.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn loop_back(mut self, loop_start_id: impl Into<String>) -> Self {
        self.loop_back_to = Some(loop_start_id.into());
        self
    }

    pub fn route_to_catch(mut self, catch_node_id: impl Into<String>) -> Self {
        self.route_to_catch = Some(catch_node_id.into());
        self
    }

    pub fn captured(mut self) -> Self {
        self.error_captured = true;
        self
    }

    pub fn fork(mut self, request: ParallelBranches) -> Self {
        self.parallel_branches = Some(request);
        self
    }

    pub fn foreach_batch(mut self, batch: ForeachBatch) -> Self {
        self.parallel_foreach_batch = Some(batch);
        self
    }

    /// Best description of what went wrong
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.data.get("error").map(crate::workflow::expressions::display_value))
            .unwrap_or_else(|| "node failed".to_string())
    }
}

/// Summary of a complete run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub success: bool,
    pub state: RunState,
    pub executed_nodes: HashSet<String>,
    pub total_nodes: usize,
    pub error: Option<String>,
    pub variables: VariableMap,
    pub duration: Duration,
}

impl RunSummary {
    pub fn executed(&self, node_id: &str) -> bool {
        self.executed_nodes.contains(node_id)
    }
}

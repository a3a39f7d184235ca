//! Node Executor - runs one task body under a deadline
//!
//! The executor never returns an error: a body error, a panic or a timeout
//! all become a failed [`ExecutionResult`]. Inside a try scope the failure is
//! flagged `error_captured` so the scheduler routes it to the catch node.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::events::{EventBus, EventType, WorkflowEvent};
use super::graph::GraphNode;
use super::registry::NodeInvocation;
use super::result::ExecutionResult;
use super::variable_resolver::PortValues;
use crate::workflow::ExecutionContext;

/// Classification of a failed node, stored as `error_type` in the result data
pub const ERROR_TIMEOUT: &str = "TimeoutError";
pub const ERROR_TASK: &str = "TaskError";
pub const ERROR_PANIC: &str = "PanicError";
pub const ERROR_FAILED: &str = "NodeFailed";

pub struct NodeExecutor<'a> {
    bus: &'a EventBus,
    run_id: &'a str,
    timeout: Duration,
}

impl<'a> NodeExecutor<'a> {
    pub fn new(bus: &'a EventBus, run_id: &'a str, timeout: Duration) -> Self {
        Self {
            bus,
            run_id,
            timeout,
        }
    }

    /// Execute a node and store its outputs.
    ///
    /// `progress` is reported on `NODE_COMPLETED` when given.
    #[instrument(skip_all, fields(node_id = %node.id, node_type = %node.node_type))]
    pub async fn execute(
        &self,
        node: &GraphNode,
        invocation: NodeInvocation,
        ctx: &ExecutionContext,
        ports: &mut PortValues,
        in_try: bool,
        progress: Option<f64>,
    ) -> ExecutionResult {
        self.bus.publish(WorkflowEvent::node(
            EventType::NodeStarted,
            self.run_id,
            &node.id,
        ));
        debug!("Executing node {}", node.display_name());

        let body = AssertUnwindSafe(node.task.execute(&invocation, ctx)).catch_unwind();
        let mut result = match tokio::time::timeout(self.timeout, body).await {
            Ok(Ok(Ok(result))) if result.success => result,
            Ok(Ok(Ok(mut result))) => {
                if result.error.is_none() {
                    result.error = Some(result.error_message());
                }
                result
                    .data
                    .entry("error_type".to_string())
                    .or_insert_with(|| Value::String(ERROR_FAILED.to_string()));
                result
            }
            Ok(Ok(Err(e))) => {
                ExecutionResult::failure(format!("{:#}", e)).with_data("error_type", ERROR_TASK)
            }
            Ok(Err(panic)) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "task panicked".to_string());
                ExecutionResult::failure(message).with_data("error_type", ERROR_PANIC)
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Node timed out");
                ExecutionResult::failure("timeout").with_data("error_type", ERROR_TIMEOUT)
            }
        };

        if !result.success && in_try {
            result.error_captured = true;
        }

        ports.store_outputs(&node.id, &result.data);

        if result.success {
            let mut event = WorkflowEvent::node(EventType::NodeCompleted, self.run_id, &node.id);
            if let Some(progress) = progress {
                event = event.with_progress(progress);
            }
            self.bus.publish(event);
        } else {
            let error = result.error_message();
            warn!(error = %error, captured = result.error_captured, "Node failed");
            self.bus.publish(
                WorkflowEvent::node(EventType::NodeError, self.run_id, &node.id).with_error(error),
            );
        }

        result
    }
}

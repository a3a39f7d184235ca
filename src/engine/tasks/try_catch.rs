//! Try / catch
//!
//! ```yaml
//! - id: guarded
//!   type: try
//!
//! - id: recover
//!   type: catch
//!   config:
//!     try_node_id: guarded
//! ```
//!
//! `try` fires `try_body`. The body chain normally ends at the catch node,
//! which then fires `exec_out`. When a node inside the body fails, the
//! scheduler records the error against the try node and runs the catch node
//! next; it then fires `catch_body` with the error on its data ports.

use async_trait::async_trait;
use tracing::info;

use crate::engine::graph::NodeCategory;
use crate::engine::registry::{NodeInvocation, TaskBody};
use crate::engine::result::ExecutionResult;
use crate::workflow::{DataType, ExecutionContext, PortDefinition};

#[derive(Debug, Default)]
pub struct TryTask;

#[async_trait]
impl TaskBody for TryTask {
    fn category(&self) -> NodeCategory {
        NodeCategory::Try
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::exec("try_body")]
    }

    async fn execute(&self, node: &NodeInvocation, ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        // Stale error from an earlier pass through this scope
        ctx.take_captured_error(&node.node_id).await;
        Ok(ExecutionResult::ok().with_next(&["try_body"]))
    }
}

#[derive(Debug, Default)]
pub struct CatchTask;

#[async_trait]
impl TaskBody for CatchTask {
    fn category(&self) -> NodeCategory {
        NodeCategory::Catch
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::exec("exec_out"),
            PortDefinition::exec("catch_body"),
            PortDefinition::data("error_message", DataType::String),
            PortDefinition::data("error_type", DataType::String),
            PortDefinition::data("error_node", DataType::String),
        ]
    }

    async fn execute(&self, node: &NodeInvocation, ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        let try_id = node.require_str("try_node_id")?;
        match ctx.take_captured_error(try_id).await {
            Some(error) => {
                info!(
                    try_node_id = try_id,
                    error_node = %error.node_id,
                    "Handling captured error: {}", error.message
                );
                Ok(ExecutionResult::ok()
                    .with_data("error_message", error.message)
                    .with_data("error_type", error.error_type)
                    .with_data("error_node", error.node_id)
                    .with_next(&["catch_body"]))
            }
            None => Ok(ExecutionResult::ok().with_next(&["exec_out"])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::CapturedError;
    use serde_json::json;

    fn catch_node() -> NodeInvocation {
        let mut node = NodeInvocation::new("catch", "catch");
        node.config.insert("try_node_id".into(), json!("try"));
        node
    }

    #[tokio::test]
    async fn test_catch_without_error_passes_through() {
        let result = CatchTask
            .execute(&catch_node(), &ExecutionContext::default())
            .await
            .unwrap();
        assert_eq!(result.next_nodes, Some(vec!["exec_out".to_string()]));
    }

    #[tokio::test]
    async fn test_catch_exposes_captured_error() {
        let ctx = ExecutionContext::default();
        ctx.capture_error(
            "try",
            CapturedError {
                message: "boom".into(),
                error_type: "TaskError".into(),
                node_id: "risky".into(),
            },
        )
        .await;

        let result = CatchTask.execute(&catch_node(), &ctx).await.unwrap();
        assert_eq!(result.next_nodes, Some(vec!["catch_body".to_string()]));
        assert_eq!(result.data["error_message"], json!("boom"));
        assert_eq!(result.data["error_node"], json!("risky"));
    }

    #[tokio::test]
    async fn test_try_fires_body() {
        let result = TryTask
            .execute(&NodeInvocation::new("try", "try"), &ExecutionContext::default())
            .await
            .unwrap();
        assert_eq!(result.next_nodes, Some(vec!["try_body".to_string()]));
    }
}

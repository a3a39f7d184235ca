//! Basic tasks
//!
//! Example:
//! ```yaml
//! - id: greet
//!   type: log
//!   config:
//!     message: "Hello {{user.name}}"
//!     level: info
//!
//! - id: remember
//!   type: set_variable
//!   config:
//!     name: greeting_sent
//!     value: true
//! ```

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::engine::graph::NodeCategory;
use crate::engine::registry::{NodeInvocation, TaskBody};
use crate::engine::result::ExecutionResult;
use crate::workflow::expressions::display_value;
use crate::workflow::{DataType, ExecutionContext, PortDefinition};

/// Entry point of a workflow
#[derive(Debug, Default)]
pub struct StartTask;

#[async_trait]
impl TaskBody for StartTask {
    fn category(&self) -> NodeCategory {
        NodeCategory::Start
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        Vec::new()
    }

    async fn execute(&self, _node: &NodeInvocation, _ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        Ok(ExecutionResult::ok())
    }
}

/// Terminal node
#[derive(Debug, Default)]
pub struct EndTask;

#[async_trait]
impl TaskBody for EndTask {
    fn category(&self) -> NodeCategory {
        NodeCategory::End
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        Vec::new()
    }

    async fn execute(&self, _node: &NodeInvocation, _ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        Ok(ExecutionResult::ok())
    }
}

/// Set one variable (`name` + `value`) or several (`variables` map)
#[derive(Debug, Default)]
pub struct SetVariableTask;

#[async_trait]
impl TaskBody for SetVariableTask {
    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::exec("exec_in"),
            PortDefinition::data("value", DataType::Any),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::exec("exec_out"),
            PortDefinition::data("value", DataType::Any),
        ]
    }

    async fn execute(&self, node: &NodeInvocation, ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        if let Some(Value::Object(vars)) = node.param("variables") {
            for (name, value) in vars {
                ctx.set_variable(name, value.clone()).await;
            }
            return Ok(ExecutionResult::ok().with_data("value", Value::Object(vars.clone())));
        }

        let name = node.require_str("name")?;
        let value = node.param("value").cloned().unwrap_or(Value::Null);
        debug!(name, "Setting variable");
        ctx.set_variable(name, value.clone()).await;
        Ok(ExecutionResult::ok().with_data("value", value))
    }
}

/// Log a message through `tracing`
#[derive(Debug, Default)]
pub struct LogTask;

#[async_trait]
impl TaskBody for LogTask {
    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::exec("exec_in"),
            PortDefinition::data("message", DataType::Any),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::exec("exec_out"),
            PortDefinition::data("message", DataType::String),
        ]
    }

    async fn execute(&self, node: &NodeInvocation, _ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        let message = node.param("message").map(display_value).unwrap_or_default();
        match node.param_str("level").unwrap_or("info") {
            "debug" => debug!(node_id = %node.node_id, "{}", message),
            "warn" | "warning" => warn!(node_id = %node.node_id, "{}", message),
            "error" => error!(node_id = %node.node_id, "{}", message),
            _ => info!(node_id = %node.node_id, "{}", message),
        }
        Ok(ExecutionResult::ok().with_data("message", message))
    }
}

/// Always fails with `message`
#[derive(Debug, Default)]
pub struct RaiseErrorTask;

#[async_trait]
impl TaskBody for RaiseErrorTask {
    fn output_ports(&self) -> Vec<PortDefinition> {
        Vec::new()
    }

    async fn execute(&self, node: &NodeInvocation, _ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        let message = node.param_str("message").unwrap_or("error raised");
        anyhow::bail!("{}", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_variable() {
        let ctx = ExecutionContext::default();
        let mut node = NodeInvocation::new("n", "set_variable");
        node.config.insert("name".into(), json!("count"));
        node.config.insert("value".into(), json!(3));

        let result = SetVariableTask.execute(&node, &ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(ctx.get_variable("count").await, Some(json!(3)));
    }

    #[tokio::test]
    async fn test_set_many_variables() {
        let ctx = ExecutionContext::default();
        let mut node = NodeInvocation::new("n", "set_variable");
        node.config.insert("variables".into(), json!({"a": 1, "b": "two"}));

        SetVariableTask.execute(&node, &ctx).await.unwrap();
        assert_eq!(ctx.get_variable("b").await, Some(json!("two")));
    }

    #[tokio::test]
    async fn test_set_variable_requires_name() {
        let node = NodeInvocation::new("n", "set_variable");
        assert!(SetVariableTask.execute(&node, &ExecutionContext::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_raise_error() {
        let mut node = NodeInvocation::new("n", "raise_error");
        node.config.insert("message".into(), json!("disk full"));
        let err = RaiseErrorTask
            .execute(&node, &ExecutionContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "disk full");
    }
}

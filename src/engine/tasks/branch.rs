//! Conditional branching
//!
//! Example:
//! ```yaml
//! - id: check
//!   type: if
//!   config:
//!     condition: "attempts < 3 && status != 'done'"
//!
//! - id: route
//!   type: switch
//!   config:
//!     value: "{{order.kind}}"
//! ```
//!
//! `if` fires `true` or `false`. `switch` fires `case_<value>` when such a
//! port is declared or connected, `default` otherwise.

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::graph::NodeCategory;
use crate::engine::registry::{NodeInvocation, TaskBody};
use crate::engine::result::ExecutionResult;
use crate::workflow::expressions::{evaluate_condition, is_truthy};
use crate::workflow::{DataType, ExecutionContext, PortDefinition};

/// Evaluate a condition parameter: booleans as-is, strings through the
/// condition evaluator, anything else by truthiness
pub(crate) async fn eval_condition(value: &Value, ctx: &ExecutionContext) -> anyhow::Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => {
            let vars = ctx.variables().snapshot().await;
            Ok(evaluate_condition(s, &vars)?)
        }
        other => Ok(is_truthy(other)),
    }
}

#[derive(Debug, Default)]
pub struct IfTask;

#[async_trait]
impl TaskBody for IfTask {
    fn category(&self) -> NodeCategory {
        NodeCategory::Branch
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::exec("exec_in"),
            PortDefinition::data("condition", DataType::Any),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::exec("true"),
            PortDefinition::exec("false"),
            PortDefinition::data("result", DataType::Boolean),
        ]
    }

    async fn execute(&self, node: &NodeInvocation, ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        let condition = node
            .param("condition")
            .ok_or_else(|| anyhow::anyhow!("node '{}' requires 'condition'", node.node_id))?;
        let taken = eval_condition(condition, ctx).await?;
        Ok(ExecutionResult::ok().with_data("result", taken))
    }
}

#[derive(Debug, Default)]
pub struct SwitchTask;

#[async_trait]
impl TaskBody for SwitchTask {
    fn category(&self) -> NodeCategory {
        NodeCategory::Branch
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::exec("exec_in"),
            PortDefinition::data("value", DataType::Any),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::exec("default"),
            PortDefinition::data("matched_case", DataType::Any),
        ]
    }

    async fn execute(&self, node: &NodeInvocation, _ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        match node.param("value") {
            Some(value) if !value.is_null() => {
                Ok(ExecutionResult::ok().with_data("matched_case", value.clone()))
            }
            _ => Ok(ExecutionResult::ok().with_next(&["default"])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_if_with_expression() {
        let ctx = ExecutionContext::default();
        ctx.set_variable("attempts", json!(2)).await;

        let mut node = NodeInvocation::new("check", "if");
        node.config.insert("condition".into(), json!("attempts < 3"));
        let result = IfTask.execute(&node, &ctx).await.unwrap();
        assert_eq!(result.data["result"], json!(true));

        node.config.insert("condition".into(), json!(false));
        let result = IfTask.execute(&node, &ctx).await.unwrap();
        assert_eq!(result.data["result"], json!(false));
    }

    #[tokio::test]
    async fn test_if_unknown_variable_fails() {
        let mut node = NodeInvocation::new("check", "if");
        node.config.insert("condition".into(), json!("missing == 1"));
        assert!(IfTask.execute(&node, &ExecutionContext::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_switch() {
        let ctx = ExecutionContext::default();
        let mut node = NodeInvocation::new("sw", "switch");
        let result = SwitchTask.execute(&node, &ctx).await.unwrap();
        assert_eq!(result.next_nodes, Some(vec!["default".to_string()]));

        node.inputs.insert("value".into(), json!("red"));
        let result = SwitchTask.execute(&node, &ctx).await.unwrap();
        assert_eq!(result.data["matched_case"], json!("red"));
        assert!(result.next_nodes.is_none());
    }
}

//! Fork / join and parallel foreach
//!
//! ```yaml
//! - id: fan_out
//!   type: fork
//!   config:
//!     join_node_id: gather
//!     fail_fast: false
//!
//! - id: gather
//!   type: join
//!   config:
//!     fork_node_id: fan_out
//!
//! - id: each_file
//!   type: parallel_foreach
//!   config:
//!     items: "{{files}}"
//!     batch_size: 4
//!     item_timeout: 30
//! ```
//!
//! A fork runs the chain behind each of its exec output ports concurrently,
//! up to the join. The join exposes `{fork}_branch_results` on its
//! `branch_results` port. A foreach runs its `body` chain once per item, in
//! batches; each item sees `current_item` / `current_index` and reports
//! through a `result` variable.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::as_list;
use crate::engine::graph::NodeCategory;
use crate::engine::registry::{NodeInvocation, TaskBody};
use crate::engine::result::{ExecutionResult, ForeachBatch, ParallelBranches};
use crate::workflow::{DataType, ExecutionContext, PortDefinition};

#[derive(Debug, Default)]
pub struct ForkTask;

#[async_trait]
impl TaskBody for ForkTask {
    fn category(&self) -> NodeCategory {
        NodeCategory::Fork
    }

    /// Branch ports are declared per workflow
    fn output_ports(&self) -> Vec<PortDefinition> {
        Vec::new()
    }

    async fn execute(&self, node: &NodeInvocation, _ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        let branches = node
            .param("branches")
            .and_then(as_list)
            .unwrap_or_default()
            .iter()
            .filter_map(|b| b.as_str().map(str::to_string))
            .collect();

        Ok(ExecutionResult::ok().fork(ParallelBranches {
            fork_node_id: node.node_id.clone(),
            branches,
            join_node_id: node.param_str("join_node_id").map(str::to_string),
            fail_fast: node.param_bool("fail_fast"),
        }))
    }
}

#[derive(Debug, Default)]
pub struct JoinTask;

#[async_trait]
impl TaskBody for JoinTask {
    fn category(&self) -> NodeCategory {
        NodeCategory::Join
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::exec("exec_out"),
            PortDefinition::data("branch_results", DataType::Dict),
        ]
    }

    async fn execute(&self, node: &NodeInvocation, ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        let results = match node.param_str("fork_node_id") {
            Some(fork) => ctx
                .get_variable(&format!("{}_branch_results", fork))
                .await
                .unwrap_or_else(|| json!({})),
            None => json!({}),
        };
        Ok(ExecutionResult::ok().with_data("branch_results", results))
    }
}

#[derive(Debug, Default)]
pub struct ParallelForeachTask;

impl ParallelForeachTask {
    fn results_var(node: &NodeInvocation) -> String {
        node.param_str("results_var")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_foreach", node.node_id))
    }

    fn item_timeout(node: &NodeInvocation) -> Option<Duration> {
        node.param("item_timeout")
            .and_then(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }
}

#[async_trait]
impl TaskBody for ParallelForeachTask {
    fn category(&self) -> NodeCategory {
        NodeCategory::ForEach
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::exec("body"),
            PortDefinition::exec("completed"),
            PortDefinition::data("results", DataType::List),
            PortDefinition::data("errors", DataType::List),
        ]
    }

    async fn execute(&self, node: &NodeInvocation, ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        let results_var = Self::results_var(node);

        let items = match ctx.node_state(&node.node_id).await {
            Some(state) => state["items"].as_array().cloned().unwrap_or_default(),
            None => {
                let items = node
                    .param("items")
                    .and_then(as_list)
                    .ok_or_else(|| anyhow::anyhow!("node '{}' requires a list of 'items'", node.node_id))?;
                ctx.set_node_state(&node.node_id, json!({ "items": items }))
                    .await;
                ctx.set_variable(&results_var, json!({ "results": [], "errors": [] }))
                    .await;
                items
            }
        };

        let accumulated = ctx
            .get_variable(&results_var)
            .await
            .unwrap_or_else(|| json!({ "results": [], "errors": [] }));
        let list = |key: &str| accumulated[key].as_array().cloned().unwrap_or_default();
        let (results, errors) = (list("results"), list("errors"));
        let processed = results.len() + errors.len();

        if processed >= items.len() {
            debug!(node_id = %node.node_id, items = items.len(), failed = errors.len(), "Foreach completed");
            ctx.clear_node_state(&node.node_id).await;
            return Ok(ExecutionResult::ok()
                .with_data("results", results)
                .with_data("errors", errors)
                .with_next(&["completed"]));
        }

        Ok(ExecutionResult::ok().foreach_batch(ForeachBatch {
            node_id: node.node_id.clone(),
            items: items[processed..].to_vec(),
            start_index: processed,
            body_port: node.param_str("body_port").unwrap_or("body").to_string(),
            results_var,
            batch_size: node.param_u64("batch_size").map(|n| n as usize),
            item_timeout: Self::item_timeout(node),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fork_request() {
        let mut node = NodeInvocation::new("fan", "fork");
        node.config.insert("branches".into(), json!(["left", "right"]));
        node.config.insert("fail_fast".into(), json!(true));

        let result = ForkTask.execute(&node, &ExecutionContext::default()).await.unwrap();
        let request = result.parallel_branches.unwrap();
        assert_eq!(request.branches, vec!["left", "right"]);
        assert_eq!(request.fail_fast, Some(true));
        assert!(request.join_node_id.is_none());
    }

    #[tokio::test]
    async fn test_join_reads_branch_results() {
        let ctx = ExecutionContext::default();
        ctx.set_variable("fan_branch_results", json!({"left": {"success": true}}))
            .await;
        let mut node = NodeInvocation::new("gather", "join");
        node.config.insert("fork_node_id".into(), json!("fan"));

        let result = JoinTask.execute(&node, &ctx).await.unwrap();
        assert_eq!(result.data["branch_results"]["left"]["success"], json!(true));
    }

    #[tokio::test]
    async fn test_foreach_batches_until_done() {
        let ctx = ExecutionContext::default();
        let mut node = NodeInvocation::new("each", "parallel_foreach");
        node.config.insert("items".into(), json!([1, 2, 3]));
        node.config.insert("batch_size".into(), json!(2));
        node.config.insert("item_timeout".into(), json!(1.5));

        let first = ParallelForeachTask.execute(&node, &ctx).await.unwrap();
        let batch = first.parallel_foreach_batch.unwrap();
        assert_eq!(batch.items.len(), 3);
        assert_eq!(batch.start_index, 0);
        assert_eq!(batch.batch_size, Some(2));
        assert_eq!(batch.item_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(batch.results_var, "each_foreach");

        // The scheduler folds two items back
        ctx.set_variable(
            "each_foreach",
            json!({ "results": [10], "errors": [{"index": 1, "error": "bad"}] }),
        )
        .await;
        let second = ParallelForeachTask.execute(&node, &ctx).await.unwrap();
        let batch = second.parallel_foreach_batch.unwrap();
        assert_eq!(batch.items, vec![json!(3)]);
        assert_eq!(batch.start_index, 2);

        ctx.set_variable(
            "each_foreach",
            json!({ "results": [10, 30], "errors": [{"index": 1, "error": "bad"}] }),
        )
        .await;
        let done = ParallelForeachTask.execute(&node, &ctx).await.unwrap();
        assert_eq!(done.next_nodes, Some(vec!["completed".to_string()]));
        assert_eq!(done.data["results"], json!([10, 30]));
        assert!(ctx.node_state("each").await.is_none());
    }

    #[tokio::test]
    async fn test_foreach_empty_items_completes() {
        let mut node = NodeInvocation::new("each", "parallel_foreach");
        node.config.insert("items".into(), json!([]));
        let result = ParallelForeachTask
            .execute(&node, &ExecutionContext::default())
            .await
            .unwrap();
        assert_eq!(result.next_nodes, Some(vec!["completed".to_string()]));
    }
}

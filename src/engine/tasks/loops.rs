//! Loop tasks
//!
//! A loop is a `for_loop_start` or `while_loop_start` node whose `body` port
//! leads to a chain ending in a `loop_end` that names the start node. The
//! scheduler re-queues the start node at the front whenever `loop_end`,
//! `break` or `continue` run, after clearing the body's executed markers.
//!
//! ```yaml
//! - id: each_user
//!   type: for_loop_start
//!   config:
//!     items: "{{users}}"
//!     loop_var: user
//!
//! - id: next_user
//!   type: loop_end
//!   config:
//!     loop_start_id: each_user
//! ```
//!
//! Iteration state lives in the context's per-node state and is cleared when
//! the loop completes, so a loop nested in another loop starts fresh.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::as_list;
use super::branch::eval_condition;
use crate::engine::graph::NodeCategory;
use crate::engine::registry::{NodeInvocation, TaskBody};
use crate::engine::result::ExecutionResult;
use crate::workflow::{DataType, ExecutionContext, PortDefinition};

const DEFAULT_MAX_ITERATIONS: u64 = 1000;

fn loop_ports() -> Vec<PortDefinition> {
    vec![
        PortDefinition::exec("body"),
        PortDefinition::exec("completed"),
        PortDefinition::data("item", DataType::Any),
        PortDefinition::data("index", DataType::Integer),
    ]
}

fn is_broken(state: &Value) -> bool {
    state.get("broken").and_then(Value::as_bool).unwrap_or(false)
}

fn completed(iterations: u64) -> ExecutionResult {
    ExecutionResult::ok()
        .with_data("iterations", iterations)
        .with_next(&["completed"])
}

/// Items of a for loop: `items`, or a range from `count` / `start`..`end` by `step`
fn loop_items(node: &NodeInvocation) -> anyhow::Result<Vec<Value>> {
    if let Some(items) = node.param("items") {
        return as_list(items)
            .ok_or_else(|| anyhow::anyhow!("node '{}': 'items' is not a list", node.node_id));
    }

    let as_i64 = |key: &str| {
        node.param(key).and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    };
    let (start, end) = match (as_i64("count"), as_i64("start"), as_i64("end")) {
        (Some(count), _, _) => (0, count),
        (None, start, Some(end)) => (start.unwrap_or(0), end),
        _ => anyhow::bail!(
            "node '{}' requires 'items', 'count' or 'end'",
            node.node_id
        ),
    };
    let step = as_i64("step").unwrap_or(1);
    if step == 0 {
        anyhow::bail!("node '{}': 'step' must not be zero", node.node_id);
    }

    let mut items = Vec::new();
    let mut i = start;
    while (step > 0 && i < end) || (step < 0 && i > end) {
        items.push(json!(i));
        i += step;
    }
    Ok(items)
}

// ============================================================================
// for_loop_start
// ============================================================================

#[derive(Debug, Default)]
pub struct ForLoopStartTask;

#[async_trait]
impl TaskBody for ForLoopStartTask {
    fn category(&self) -> NodeCategory {
        NodeCategory::LoopStart
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        loop_ports()
    }

    async fn execute(&self, node: &NodeInvocation, ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        let state = match ctx.node_state(&node.node_id).await {
            Some(state) => state,
            None => json!({ "items": loop_items(node)?, "index": 0, "broken": false }),
        };

        let items = state["items"].as_array().cloned().unwrap_or_default();
        let index = state["index"].as_u64().unwrap_or(0);

        if is_broken(&state) || index as usize >= items.len() {
            debug!(node_id = %node.node_id, iterations = index, "Loop completed");
            ctx.clear_node_state(&node.node_id).await;
            return Ok(completed(index));
        }

        let item = items[index as usize].clone();
        let loop_var = node.param_str("loop_var").unwrap_or("item");
        let index_var = node.param_str("index_var").unwrap_or("index");
        ctx.set_variable(loop_var, item.clone()).await;
        ctx.set_variable(index_var, json!(index)).await;

        ctx.set_node_state(
            &node.node_id,
            json!({ "items": items, "index": index + 1, "broken": false }),
        )
        .await;

        Ok(ExecutionResult::ok()
            .with_data("item", item)
            .with_data("index", index)
            .with_next(&["body"]))
    }
}

// ============================================================================
// while_loop_start
// ============================================================================

#[derive(Debug, Default)]
pub struct WhileLoopStartTask;

#[async_trait]
impl TaskBody for WhileLoopStartTask {
    fn category(&self) -> NodeCategory {
        NodeCategory::LoopStart
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        loop_ports()
    }

    async fn execute(&self, node: &NodeInvocation, ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        let state = ctx
            .node_state(&node.node_id)
            .await
            .unwrap_or_else(|| json!({ "index": 0, "broken": false }));
        let index = state["index"].as_u64().unwrap_or(0);
        let max_iterations = node
            .param_u64("max_iterations")
            .unwrap_or(DEFAULT_MAX_ITERATIONS);

        let keep_going = if is_broken(&state) {
            false
        } else if index >= max_iterations {
            warn!(node_id = %node.node_id, max_iterations, "While loop hit max_iterations");
            false
        } else {
            let condition = node
                .param("condition")
                .ok_or_else(|| anyhow::anyhow!("node '{}' requires 'condition'", node.node_id))?;
            eval_condition(condition, ctx).await?
        };

        if !keep_going {
            ctx.clear_node_state(&node.node_id).await;
            return Ok(completed(index));
        }

        let index_var = node.param_str("index_var").unwrap_or("index");
        ctx.set_variable(index_var, json!(index)).await;
        ctx.set_node_state(&node.node_id, json!({ "index": index + 1, "broken": false }))
            .await;

        Ok(ExecutionResult::ok()
            .with_data("index", index)
            .with_next(&["body"]))
    }
}

// ============================================================================
// loop_end / break / continue
// ============================================================================

fn loop_start_id(node: &NodeInvocation) -> anyhow::Result<String> {
    node.require_str("loop_start_id").map(str::to_string)
}

#[derive(Debug, Default)]
pub struct LoopEndTask;

#[async_trait]
impl TaskBody for LoopEndTask {
    fn category(&self) -> NodeCategory {
        NodeCategory::LoopEnd
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        Vec::new()
    }

    async fn execute(&self, node: &NodeInvocation, _ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        Ok(ExecutionResult::ok().loop_back(loop_start_id(node)?))
    }
}

/// Ends the loop: the start node fires `completed` on its next visit
#[derive(Debug, Default)]
pub struct BreakTask;

#[async_trait]
impl TaskBody for BreakTask {
    fn category(&self) -> NodeCategory {
        NodeCategory::LoopControl
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        Vec::new()
    }

    async fn execute(&self, node: &NodeInvocation, ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        let start = loop_start_id(node)?;
        let mut state = ctx
            .node_state(&start)
            .await
            .unwrap_or_else(|| json!({ "index": 0 }));
        state["broken"] = json!(true);
        ctx.set_node_state(&start, state).await;
        Ok(ExecutionResult::ok().loop_back(start))
    }
}

/// Skips the rest of the body for the current iteration
#[derive(Debug, Default)]
pub struct ContinueTask;

#[async_trait]
impl TaskBody for ContinueTask {
    fn category(&self) -> NodeCategory {
        NodeCategory::LoopControl
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        Vec::new()
    }

    async fn execute(&self, node: &NodeInvocation, _ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        Ok(ExecutionResult::ok().loop_back(loop_start_id(node)?))
    }
}

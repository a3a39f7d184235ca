//! Routing Orchestrator - decides what a result does to the queue
//!
//! Special routing keys are checked in priority order: `loop_back_to`,
//! `route_to_catch`, `error_captured`, `parallel_branches`,
//! `parallel_foreach_batch`. Anything else falls back to normal port routing.

use std::collections::HashSet;

use tracing::{debug, warn};

use super::graph::{NodeCategory, WorkflowGraph};
use super::result::{ExecutionResult, ForeachBatch, ParallelBranches};

/// An open try scope on the scheduler's stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryFrame {
    pub try_id: String,
    pub catch_id: String,
}

/// Fully resolved fork request
#[derive(Debug, Clone)]
pub struct ForkPlan {
    pub fork_id: String,
    pub join_id: Option<String>,
    pub fail_fast: bool,
    /// (branch port, entry nodes)
    pub branches: Vec<(String, Vec<String>)>,
}

/// What the scheduler should do after a successful node
#[derive(Debug, Clone)]
pub enum Routing {
    /// Clear `clear` from the executed set and run `loop_start` next
    LoopBack {
        loop_start: String,
        clear: HashSet<String>,
    },
    /// Run a catch node next
    Catch {
        catch_id: String,
        /// Try scope whose error is being handled, when known
        try_id: Option<String>,
    },
    Fork(ForkPlan),
    Foreach(ForeachBatch),
    /// Append these nodes to the back of the queue
    Next(Vec<String>),
}

pub struct RoutingOrchestrator<'g> {
    graph: &'g WorkflowGraph,
}

impl<'g> RoutingOrchestrator<'g> {
    pub fn new(graph: &'g WorkflowGraph) -> Self {
        Self { graph }
    }

    /// Route a successful result
    pub fn route(
        &self,
        node_id: &str,
        result: &ExecutionResult,
        try_stack: &[TryFrame],
        default_fail_fast: bool,
    ) -> Routing {
        if let Some(loop_start) = &result.loop_back_to {
            return self.loop_back(node_id, loop_start);
        }

        if let Some(catch_id) = &result.route_to_catch {
            let try_id = try_stack
                .iter()
                .rev()
                .find(|f| &f.catch_id == catch_id)
                .map(|f| f.try_id.clone());
            return Routing::Catch {
                catch_id: catch_id.clone(),
                try_id,
            };
        }

        if result.error_captured {
            match self.nearest_catch(try_stack) {
                Some(frame) => {
                    return Routing::Catch {
                        catch_id: frame.catch_id.clone(),
                        try_id: Some(frame.try_id.clone()),
                    }
                }
                None => warn!(node_id, "error_captured outside any try scope, routing normally"),
            }
        }

        if let Some(request) = &result.parallel_branches {
            return Routing::Fork(self.plan_fork(node_id, request, default_fail_fast));
        }

        if let Some(batch) = &result.parallel_foreach_batch {
            return Routing::Foreach(batch.clone());
        }

        Routing::Next(self.graph.get_next_nodes(node_id, result))
    }

    /// Innermost open try scope
    pub fn nearest_catch<'s>(&self, try_stack: &'s [TryFrame]) -> Option<&'s TryFrame> {
        try_stack.last()
    }

    /// Frame to push when a node opens a try scope
    pub fn open_try_scope(&self, node_id: &str) -> Option<TryFrame> {
        let node = self.graph.node(node_id)?;
        if node.category != NodeCategory::Try {
            return None;
        }
        match self.graph.paired_catch(node_id) {
            Some(catch_id) => Some(TryFrame {
                try_id: node_id.to_string(),
                catch_id,
            }),
            None => {
                warn!(node_id, "Try node has no paired catch node");
                None
            }
        }
    }

    fn loop_back(&self, node_id: &str, loop_start: &str) -> Routing {
        let loop_end = self
            .graph
            .paired_loop_end(loop_start)
            .unwrap_or_else(|| node_id.to_string());
        let mut clear = self.graph.find_loop_body_nodes(loop_start, &loop_end);
        clear.insert(loop_end);
        clear.insert(node_id.to_string());
        clear.remove(loop_start);
        debug!(loop_start, cleared = clear.len(), "Loop back");
        Routing::LoopBack {
            loop_start: loop_start.to_string(),
            clear,
        }
    }

    /// Resolve branch entry nodes, the paired join and the failure policy
    pub fn plan_fork(&self, node_id: &str, request: &ParallelBranches, default_fail_fast: bool) -> ForkPlan {
        let fork_id = if request.fork_node_id.is_empty() {
            node_id.to_string()
        } else {
            request.fork_node_id.clone()
        };
        let join_id = request
            .join_node_id
            .clone()
            .filter(|id| self.graph.contains(id))
            .or_else(|| self.graph.paired_join(&fork_id));
        if join_id.is_none() {
            warn!(fork_id = %fork_id, "Fork has no paired join node");
        }

        let ports = if request.branches.is_empty() {
            self.graph.connected_exec_ports(node_id)
        } else {
            request.branches.clone()
        };
        let branches = ports
            .iter()
            .map(|port| (port.clone(), self.graph.exec_targets(node_id, port)))
            .collect();

        ForkPlan {
            fork_id,
            join_id,
            fail_fast: request.fail_fast.unwrap_or(default_fail_fast),
            branches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::TaskRegistry;
    use crate::workflow::{NodeDefinition, WorkflowDefinition};

    fn graph() -> WorkflowGraph {
        let def = WorkflowDefinition::new("routing")
            .node(NodeDefinition::new("s", "start"))
            .node(NodeDefinition::new("try", "try"))
            .node(NodeDefinition::new("risky", "log"))
            .node(NodeDefinition::new("catch", "catch").with_config("try_node_id", "try"))
            .node(NodeDefinition::new("fork", "fork").with_config("branches", vec!["b1", "b2"]))
            .node(NodeDefinition::new("x", "log"))
            .node(NodeDefinition::new("y", "log"))
            .node(NodeDefinition::new("join", "join").with_config("fork_node_id", "fork"))
            .link("s", "try")
            .link_port("try", "try_body", "risky")
            .link("risky", "catch")
            .link("catch", "fork")
            .link_port("fork", "b1", "x")
            .link_port("fork", "b2", "y")
            .link("x", "join")
            .link("y", "join");
        WorkflowGraph::build(&def, &TaskRegistry::with_builtins()).unwrap()
    }

    #[test]
    fn test_normal_routing() {
        let graph = graph();
        let orchestrator = RoutingOrchestrator::new(&graph);
        match orchestrator.route("s", &ExecutionResult::ok(), &[], false) {
            Routing::Next(next) => assert_eq!(next, vec!["try"]),
            other => panic!("unexpected routing {:?}", other),
        }
    }

    #[test]
    fn test_loop_back_has_priority() {
        let graph = graph();
        let orchestrator = RoutingOrchestrator::new(&graph);
        let result = ExecutionResult::ok().loop_back("s").route_to_catch("catch");
        assert!(matches!(
            orchestrator.route("risky", &result, &[], false),
            Routing::LoopBack { .. }
        ));
    }

    #[test]
    fn test_captured_error_uses_innermost_frame() {
        let graph = graph();
        let orchestrator = RoutingOrchestrator::new(&graph);
        let frame = orchestrator.open_try_scope("try").unwrap();
        assert_eq!(frame.catch_id, "catch");

        let outer = TryFrame {
            try_id: "outer".into(),
            catch_id: "outer_catch".into(),
        };
        let stack = vec![outer, frame];
        match orchestrator.route("risky", &ExecutionResult::ok().captured(), &stack, false) {
            Routing::Catch { catch_id, try_id } => {
                assert_eq!(catch_id, "catch");
                assert_eq!(try_id.as_deref(), Some("try"));
            }
            other => panic!("unexpected routing {:?}", other),
        }
    }

    #[test]
    fn test_fork_plan_resolves_join_and_entries() {
        let graph = graph();
        let orchestrator = RoutingOrchestrator::new(&graph);
        let request = ParallelBranches {
            fork_node_id: "fork".into(),
            branches: vec!["b1".into(), "b2".into()],
            join_node_id: None,
            fail_fast: None,
        };
        let plan = orchestrator.plan_fork("fork", &request, true);
        assert_eq!(plan.join_id.as_deref(), Some("join"));
        assert!(plan.fail_fast);
        assert_eq!(plan.branches[0], ("b1".to_string(), vec!["x".to_string()]));
        assert_eq!(plan.branches[1], ("b2".to_string(), vec!["y".to_string()]));
    }
}

//! Scheduling loop
//!
//! A [`Scope`] owns one execution queue together with its context, port
//! values, state manager and try stack. The top-level run, every fork
//! branch and every foreach item are scopes; sub-scopes are spawned as tokio
//! tasks whose handles the parent keeps until their results are folded back.
//! Dropping a scope aborts whatever it still has in flight.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::future::{select_all, BoxFuture};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use super::events::{EventBus, EventType, WorkflowEvent};
use super::graph::{NodeCategory, WorkflowGraph};
use super::node_executor::NodeExecutor;
use super::orchestrator::{ForkPlan, Routing, RoutingOrchestrator, TryFrame};
use super::parallel::{self, BatchReport, ForkReport, ScopedTask};
use super::result::{ExecutionResult, ForeachBatch};
use super::state_manager::{ExecutionStateManager, RunState};
use super::variable_resolver::{PortValues, VariableResolver};
use crate::workflow::{CapturedError, ExecutionContext, ExecutionSettings, VariableMap};

/// Immutable data shared by every scope of one run
#[derive(Debug)]
pub struct RunShared {
    pub graph: Arc<WorkflowGraph>,
    pub bus: Arc<EventBus>,
    pub settings: ExecutionSettings,
    pub run_id: String,
}

/// Final report of a scope
#[derive(Debug, Clone)]
pub struct ScopeOutcome {
    pub state: RunState,
    pub error: Option<String>,
    pub executed: HashSet<String>,
    pub ports: PortValues,
    pub variables: VariableMap,
    pub target_reached: bool,
}

impl ScopeOutcome {
    pub fn success(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: RunState::Failed,
            error: Some(error.into()),
            executed: HashSet::new(),
            ports: PortValues::new(),
            variables: VariableMap::new(),
            target_reached: false,
        }
    }
}

pub(crate) enum SubRunReport {
    Fork(ForkReport),
    Batch(BatchReport),
}

enum Pending {
    Fork(ForkPlan),
    Batch(ForeachBatch),
}

struct InFlight {
    pending: Pending,
    handle: ScopedTask<SubRunReport>,
}

pub struct Scope {
    shared: Arc<RunShared>,
    queue: VecDeque<String>,
    ctx: ExecutionContext,
    ports: PortValues,
    state: ExecutionStateManager,
    /// Boundary node: reached but never executed by this scope
    stop_at: Option<String>,
    try_stack: Vec<TryFrame>,
    in_flight: Vec<InFlight>,
    report_progress: bool,
}

impl Scope {
    /// Top-level scope
    pub fn root(
        shared: Arc<RunShared>,
        entry: Vec<String>,
        ctx: ExecutionContext,
        ports: PortValues,
        state: ExecutionStateManager,
    ) -> Self {
        Self {
            shared,
            queue: entry.into(),
            ctx,
            ports,
            state,
            stop_at: None,
            try_stack: Vec::new(),
            in_flight: Vec::new(),
            report_progress: true,
        }
    }

    /// Fork branch or foreach item scope
    pub fn branch(
        shared: Arc<RunShared>,
        entry: Vec<String>,
        ctx: ExecutionContext,
        ports: PortValues,
        state: ExecutionStateManager,
        stop_at: Option<String>,
    ) -> Self {
        Self {
            shared,
            queue: entry.into(),
            ctx,
            ports,
            state,
            stop_at,
            try_stack: Vec::new(),
            in_flight: Vec::new(),
            report_progress: false,
        }
    }

    /// Drive the queue to exhaustion, failure, stop or the target node
    pub fn run(mut self) -> BoxFuture<'static, ScopeOutcome> {
        async move {
            loop {
                self.collect_finished().await;
                if self.state.should_stop() || self.state.target_reached() {
                    break;
                }
                if self.queue.is_empty() {
                    if self.in_flight.is_empty() {
                        break;
                    }
                    self.await_next_in_flight().await;
                    continue;
                }
                if !self.state.pause_checkpoint().await {
                    break;
                }
                if let Some(node_id) = self.queue.pop_front() {
                    self.step(&node_id).await;
                }
            }
            self.finish().await
        }
        .boxed()
    }

    // ========================================================================
    // One queue iteration
    // ========================================================================

    async fn step(&mut self, node_id: &str) {
        let graph = self.shared.graph.clone();
        let Some(node) = graph.node(node_id) else {
            warn!(node_id, "Queued node does not exist");
            return;
        };

        if self.stop_at.as_deref() == Some(node_id) {
            debug!(node_id, "Scope boundary reached");
            return;
        }
        if self.state.is_executed(node_id)
            && (!node.category.is_control_flow() || node.category.closes_scope())
        {
            debug!(node_id, "Node already executed, skipping");
            return;
        }
        if !self.state.should_execute_node(node_id) {
            debug!(node_id, "Node outside target subgraph, skipping");
            self.publish(WorkflowEvent::node(
                EventType::NodeSkipped,
                &self.shared.run_id,
                node_id,
            ));
            return;
        }

        let resolver = VariableResolver::new(&graph);
        let invocation = resolver.prepare(node, &self.ctx, &mut self.ports).await;
        let progress = self
            .report_progress
            .then(|| self.state.projected_progress(node_id));
        let executor = NodeExecutor::new(
            &self.shared.bus,
            &self.shared.run_id,
            self.shared.settings.node_timeout,
        );
        let in_try = self.enclosing_try(node_id).is_some();
        let result = executor
            .execute(node, invocation, &self.ctx, &mut self.ports, in_try, progress)
            .await;
        resolver.validate_output_ports(node, &result);

        if !result.success {
            self.handle_failure(node_id, &result).await;
            return;
        }

        self.state.mark_node_executed(node_id);
        if self.report_progress {
            self.publish_progress();
        }
        self.track_try_scope(node_id, node.category);

        if self.state.mark_target_reached(node_id) {
            return;
        }

        self.apply_routing(node_id, &result).await;
    }

    async fn apply_routing(&mut self, node_id: &str, result: &ExecutionResult) {
        let graph = self.shared.graph.clone();
        let orchestrator = RoutingOrchestrator::new(&graph);
        let frames = self.frames_enclosing(node_id);
        let routing = orchestrator.route(node_id, result, &frames, self.shared.settings.fail_fast);

        match routing {
            Routing::LoopBack { loop_start, clear } => {
                self.state.unmark_nodes(clear.iter());
                self.queue.retain(|id| !clear.contains(id));
                self.queue.push_front(loop_start);
            }
            Routing::Catch { catch_id, try_id } => {
                if result.error_captured {
                    if let Some(try_id) = &try_id {
                        let error = Self::captured_error(node_id, result);
                        self.ctx.capture_error(try_id, error).await;
                    }
                }
                self.rearm(&catch_id);
                self.queue.push_front(catch_id);
            }
            Routing::Fork(plan) => self.launch_fork(plan).await,
            Routing::Foreach(batch) => self.launch_batch(batch).await,
            Routing::Next(next) => self.queue.extend(next),
        }
    }

    /// Frames stay open once entered; membership in a try body is decided
    /// structurally, so a body chain still queued after the catch ran is
    /// covered as well
    fn track_try_scope(&mut self, node_id: &str, category: NodeCategory) {
        if category != NodeCategory::Try {
            return;
        }
        let graph = self.shared.graph.clone();
        if let Some(frame) = RoutingOrchestrator::new(&graph).open_try_scope(node_id) {
            if !self.try_stack.contains(&frame) {
                self.try_stack.push(frame);
            }
        }
    }

    /// Open try frames whose body contains `node_id`, outermost first
    fn frames_enclosing(&self, node_id: &str) -> Vec<TryFrame> {
        self.try_stack
            .iter()
            .filter(|f| self.shared.graph.try_body_nodes(&f.try_id).contains(node_id))
            .cloned()
            .collect()
    }

    /// Innermost open try scope whose body contains `node_id`
    fn enclosing_try(&self, node_id: &str) -> Option<TryFrame> {
        self.try_stack
            .iter()
            .rev()
            .find(|f| self.shared.graph.try_body_nodes(&f.try_id).contains(node_id))
            .cloned()
    }

    /// A catch runs once per pass; a routed error opens it again
    fn rearm(&mut self, catch_id: &str) {
        self.state.unmark_nodes([catch_id.to_string()].iter());
    }

    // ========================================================================
    // Failure handling
    // ========================================================================

    fn captured_error(node_id: &str, result: &ExecutionResult) -> CapturedError {
        CapturedError {
            message: result.error_message(),
            error_type: result
                .data
                .get("error_type")
                .and_then(Value::as_str)
                .unwrap_or("NodeError")
                .to_string(),
            node_id: node_id.to_string(),
        }
    }

    async fn handle_failure(&mut self, node_id: &str, result: &ExecutionResult) {
        let message = result.error_message();

        if result.error_captured {
            if let Some(frame) = self.enclosing_try(node_id) {
                info!(node_id, catch = %frame.catch_id, "Routing error to catch node");
                let error = Self::captured_error(node_id, result);
                self.ctx.capture_error(&frame.try_id, error).await;

                let body = self.shared.graph.try_body_nodes(&frame.try_id);
                self.queue.retain(|id| !body.contains(id));
                self.rearm(&frame.catch_id);
                self.queue.push_front(frame.catch_id);
                return;
            }
        }

        if self.shared.settings.continue_on_error {
            warn!(node_id, "Node failed, continuing: {}", message);
            return;
        }

        error!(node_id, "Node failed: {}", message);
        self.state
            .mark_failed(format!("Node '{}' failed: {}", node_id, message));
    }

    /// Escalate an aggregate failure of a fork or foreach node
    async fn fail_unit(&mut self, node_id: &str, message: String) {
        let mut result = ExecutionResult::failure(message).with_data("error_type", "AggregateError");
        result.error_captured = self.enclosing_try(node_id).is_some();
        self.handle_failure(node_id, &result).await;
    }

    // ========================================================================
    // Concurrent sub-executions
    // ========================================================================

    async fn launch_fork(&mut self, plan: ForkPlan) {
        info!(
            fork_id = %plan.fork_id,
            branches = plan.branches.len(),
            fail_fast = plan.fail_fast,
            "Launching fork"
        );
        let handle = parallel::spawn_fork(
            self.shared.clone(),
            &plan,
            &self.ctx,
            &self.state,
            &self.ports,
        )
        .await;
        self.in_flight.push(InFlight {
            pending: Pending::Fork(plan),
            handle,
        });
    }

    async fn launch_batch(&mut self, mut batch: ForeachBatch) {
        let size = batch
            .batch_size
            .unwrap_or(self.shared.settings.foreach_batch_size)
            .max(1);
        batch.items.truncate(size);
        info!(
            node_id = %batch.node_id,
            items = batch.items.len(),
            start_index = batch.start_index,
            "Launching foreach batch"
        );
        let handle = parallel::spawn_batch(
            self.shared.clone(),
            &batch,
            &self.ctx,
            &self.state,
            &self.ports,
        )
        .await;
        self.in_flight.push(InFlight {
            pending: Pending::Batch(batch),
            handle,
        });
    }

    /// Fold back sub-executions that have already finished
    async fn collect_finished(&mut self) {
        while let Some(pos) = self.in_flight.iter().position(|f| f.handle.is_finished()) {
            let done = self.in_flight.remove(pos);
            let report = done.handle.await;
            self.complete(done.pending, report).await;
        }
    }

    /// Block until any sub-execution finishes
    async fn await_next_in_flight(&mut self) {
        let (report, index, _) = select_all(self.in_flight.iter_mut().map(|f| &mut f.handle)).await;
        let done = self.in_flight.remove(index);
        self.complete(done.pending, report).await;
    }

    async fn complete(
        &mut self,
        pending: Pending,
        report: Result<SubRunReport, tokio::task::JoinError>,
    ) {
        match (pending, report) {
            (Pending::Fork(plan), Ok(SubRunReport::Fork(report))) => {
                self.complete_fork(plan, report).await
            }
            (Pending::Batch(batch), Ok(SubRunReport::Batch(report))) => {
                self.complete_batch(batch, report).await
            }
            (Pending::Fork(plan), Err(e)) => {
                self.fail_unit(&plan.fork_id, format!("fork task failed: {}", e))
                    .await
            }
            (Pending::Batch(batch), Err(e)) => {
                self.fail_unit(&batch.node_id, format!("foreach task failed: {}", e))
                    .await
            }
            (_, Ok(_)) => error!("Mismatched sub-execution report"),
        }
    }

    fn absorb(&mut self, outcome: &ScopeOutcome) {
        self.state.merge_executed(&outcome.executed);
        self.ports.merge_outputs(&outcome.ports);
        if outcome.target_reached {
            if let Some(target) = self.state.target().map(str::to_string) {
                self.state.mark_target_reached(&target);
            }
        }
    }

    async fn complete_fork(&mut self, plan: ForkPlan, report: ForkReport) {
        let mut summary = Map::new();
        let mut failed = 0;
        for branch in &report.branches {
            self.absorb(&branch.outcome);
            if !branch.outcome.success() {
                failed += 1;
            }
            summary.insert(
                branch.branch.clone(),
                json!({
                    "success": branch.outcome.success(),
                    "error": branch.outcome.error,
                    "variables": branch.outcome.variables,
                }),
            );
        }
        self.ctx
            .set_variable(
                &format!("{}_branch_results", plan.fork_id),
                Value::Object(summary),
            )
            .await;

        if self.state.should_stop() || self.state.target_reached() {
            return;
        }

        let total = report.branches.len();
        if total > 0 && (failed == total || (plan.fail_fast && failed > 0)) {
            let message = if plan.fail_fast && failed < total {
                format!("fork '{}' cancelled after a branch failed", plan.fork_id)
            } else {
                format!("all {} branches of fork '{}' failed", total, plan.fork_id)
            };
            self.fail_unit(&plan.fork_id, message).await;
            return;
        }

        info!(fork_id = %plan.fork_id, failed, total, "Fork completed");
        if let Some(join) = plan.join_id {
            self.queue.push_front(join);
        }
    }

    async fn complete_batch(&mut self, batch: ForeachBatch, report: BatchReport) {
        let mut accumulator = self
            .ctx
            .get_variable(&batch.results_var)
            .await
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({ "results": [], "errors": [] }));

        let mut failed = 0;
        for item in &report.items {
            if let Some(outcome) = &item.outcome {
                self.absorb(outcome);
            }
            let (key, entry) = if item.success {
                ("results", item.result.clone())
            } else {
                failed += 1;
                (
                    "errors",
                    json!({ "index": item.index, "item": item.item, "error": item.error }),
                )
            };
            if let Some(list) = accumulator.get_mut(key).and_then(Value::as_array_mut) {
                list.push(entry);
            } else {
                accumulator[key] = json!([entry]);
            }
        }
        self.ctx.set_variable(&batch.results_var, accumulator).await;

        if self.state.should_stop() || self.state.target_reached() {
            return;
        }

        let total = report.items.len();
        if total > 0 && failed == total {
            self.fail_unit(
                &batch.node_id,
                format!("all {} items of foreach batch failed", total),
            )
            .await;
            return;
        }

        self.queue.push_front(batch.node_id);
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    fn publish(&self, event: WorkflowEvent) {
        self.shared.bus.publish(event);
    }

    fn publish_progress(&self) {
        self.publish(
            WorkflowEvent::new(EventType::WorkflowProgress, &self.shared.run_id)
                .with_progress(self.state.calculate_progress())
                .with_counts(self.state.executed_count(), self.state.total_nodes()),
        );
    }

    async fn finish(mut self) -> ScopeOutcome {
        // No sub-execution may outlive its scope
        for done in std::mem::take(&mut self.in_flight) {
            match done.handle.await {
                Ok(SubRunReport::Fork(report)) => {
                    report.branches.iter().for_each(|b| self.absorb(&b.outcome))
                }
                Ok(SubRunReport::Batch(report)) => report
                    .items
                    .iter()
                    .filter_map(|i| i.outcome.as_ref())
                    .for_each(|o| self.absorb(o)),
                Err(e) => warn!("Sub-execution ended abnormally: {}", e),
            }
        }

        if !self.state.state().is_terminal() {
            if self.state.should_stop() {
                self.state.stop();
            } else {
                self.state.mark_completed();
            }
        }

        ScopeOutcome {
            state: self.state.state(),
            error: self.state.error().map(str::to_string),
            executed: self.state.executed_nodes().clone(),
            ports: self.ports,
            variables: self.ctx.variables().snapshot().await,
            target_reached: self.state.target_reached(),
        }
    }
}

//! Workflow Executor - public entry point of the engine
//!
//! The executor owns a validated [`WorkflowGraph`] and the run settings, and:
//! 1. Finds the start node(s) and configures "run to node" mode
//! 2. Drives the scheduling loop (or one loop per start node with `run_all`)
//! 3. Publishes exactly one terminal event per run
//! 4. Caches node outputs so a single node can be re-run later
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nodeflow::prelude::*;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let definition = WorkflowLoader::load_file("flow.yaml".as_ref())?;
//! let registry = TaskRegistry::with_builtins();
//! let bus = Arc::new(EventBus::new());
//!
//! let mut executor = WorkflowExecutor::from_definition(&definition, &registry, bus)?;
//! let summary = executor.run(false).await?;
//! println!("{} nodes executed", summary.executed_nodes.len());
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::error::EngineError;
use super::events::{EventBus, EventType, WorkflowEvent};
use super::graph::WorkflowGraph;
use super::node_executor::NodeExecutor;
use super::parallel::ScopedTask;
use super::registry::TaskRegistry;
use super::result::RunSummary;
use super::scheduler::{RunShared, Scope, ScopeOutcome};
use super::state_manager::{ExecutionStateManager, RunState, StopSignal};
use super::variable_resolver::{PortValues, VariableResolver};
use crate::workflow::{
    ExecutionContext, ExecutionSettings, PauseSignal, ResourceHandle, VariableMap,
    WorkflowDefinition,
};

/// Runs one workflow graph, possibly many times
pub struct WorkflowExecutor {
    graph: Arc<WorkflowGraph>,
    bus: Arc<EventBus>,
    settings: ExecutionSettings,
    variables: VariableMap,
    resource: Option<Arc<dyn ResourceHandle>>,
    pause: PauseSignal,
    stop: StopSignal,
    state: RunState,
    /// Node outputs of previous runs, used by single-node execution
    port_cache: PortValues,
}

impl WorkflowExecutor {
    pub fn new(graph: WorkflowGraph, bus: Arc<EventBus>) -> Self {
        Self {
            graph: Arc::new(graph),
            bus,
            settings: ExecutionSettings::default(),
            variables: VariableMap::new(),
            resource: None,
            pause: PauseSignal::new(),
            stop: StopSignal::new(),
            state: RunState::Idle,
            port_cache: PortValues::new(),
        }
    }

    /// Build and validate the graph of a definition, seeding its variables
    pub fn from_definition(
        definition: &WorkflowDefinition,
        registry: &TaskRegistry,
        bus: Arc<EventBus>,
    ) -> Result<Self, EngineError> {
        let graph = WorkflowGraph::build(definition, registry)?;
        Ok(Self::new(graph, bus).with_variables(definition.variables.clone()))
    }

    pub fn with_settings(mut self, settings: ExecutionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the initial variable map
    pub fn with_variables(mut self, variables: VariableMap) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_variable(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(name.to_string(), value.into());
        self
    }

    /// Use a host-owned pause signal
    pub fn with_pause_signal(mut self, pause: PauseSignal) -> Self {
        self.pause = pause;
        self
    }

    /// Resource handed to the top-level context of every run
    pub fn with_resource(mut self, resource: Arc<dyn ResourceHandle>) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// State of the last (or current) run
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Handle for stopping a run from another task.
    ///
    /// A stop issued before `run` is polled applies to that run; the signal is
    /// cleared once the run has finished.
    pub fn stop_handle(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn pause_signal(&self) -> PauseSignal {
        self.pause.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn pause(&self) {
        self.pause.pause();
    }

    pub fn resume(&self) {
        self.pause.resume();
    }

    /// Output of a node from a previous run
    pub fn cached_output(&self, node_id: &str, port: &str) -> Option<&Value> {
        self.port_cache.output(node_id, port)
    }

    // ========================================================================
    // Runs
    // ========================================================================

    /// Run the workflow.
    ///
    /// Structural problems (no start node, unknown target) are returned as
    /// errors after a `WORKFLOW_ERROR` event; everything else ends in the
    /// summary's state.
    #[instrument(skip(self), fields(workflow = %self.graph.name()))]
    pub async fn run(&mut self, run_all: bool) -> Result<RunSummary, EngineError> {
        if self.settings.single_node {
            let node_id = self
                .settings
                .target_node_id
                .clone()
                .ok_or_else(|| EngineError::TargetNotFound("<none>".to_string()))?;
            return self.run_single_node(&node_id).await;
        }

        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let total = self.graph.len();

        let starts = self.graph.find_start_nodes();
        if starts.is_empty() {
            return Err(self.structural_error(
                &run_id,
                EngineError::NoStartNode(self.graph.name().to_string()),
            ));
        }
        let entry: Vec<String> = if run_all {
            starts.clone()
        } else {
            if starts.len() > 1 {
                info!(starts = starts.len(), "Multiple start nodes; running only '{}'", starts[0]);
            }
            vec![starts[0].clone()]
        };

        let mut state = ExecutionStateManager::new(total, self.stop.clone(), self.pause.clone());
        if let Some(target) = self.settings.target_node_id.clone() {
            if let Err(e) = state.configure_target(&self.graph, &entry, &target) {
                return Err(self.structural_error(&run_id, e));
            }
        }

        state.start_execution();
        self.state = RunState::Running;

        let ctx = self.build_context(&run_id);
        info!(run_id = %run_id, nodes = total, "Starting workflow");
        self.bus.publish(
            WorkflowEvent::new(EventType::WorkflowStarted, &run_id).with_counts(0, total),
        );

        let shared = Arc::new(RunShared {
            graph: self.graph.clone(),
            bus: self.bus.clone(),
            settings: self.settings.clone(),
            run_id: run_id.clone(),
        });

        let outcome = if entry.len() > 1 {
            Self::run_concurrently(shared, &entry, &ctx, &state).await
        } else {
            Scope::root(shared, entry, ctx.clone(), PortValues::new(), state)
                .run()
                .await
        };
        ctx.release().await;
        // A stop request ends with the run it was aimed at
        self.stop.reset();

        self.state = outcome.state;
        self.port_cache.merge_outputs(&outcome.ports);
        self.publish_terminal(&run_id, outcome.state, outcome.error.clone(), outcome.executed.len(), total);

        Ok(RunSummary {
            run_id,
            success: outcome.success(),
            state: outcome.state,
            executed_nodes: outcome.executed,
            total_nodes: total,
            error: outcome.error,
            variables: outcome.variables,
            duration: started.elapsed(),
        })
    }

    /// Run the workflow, reporting only whether it completed
    pub async fn execute(&mut self, run_all: bool) -> bool {
        match self.run(run_all).await {
            Ok(summary) => summary.success,
            Err(e) => {
                error!("Workflow could not run: {}", e);
                false
            }
        }
    }

    /// Every start node roots its own scope. The variable map is shared
    /// between them; each owns a duplicate of the resource handle.
    async fn run_concurrently(
        shared: Arc<RunShared>,
        starts: &[String],
        ctx: &ExecutionContext,
        state: &ExecutionStateManager,
    ) -> ScopeOutcome {
        info!(workflows = starts.len(), "Running start nodes concurrently");

        let mut contexts = Vec::with_capacity(starts.len());
        let mut handles = Vec::with_capacity(starts.len());
        for start in starts {
            let sub_ctx = ctx.shared_with_own_resource();
            let scope = Scope::root(
                shared.clone(),
                vec![start.clone()],
                sub_ctx.clone(),
                PortValues::new(),
                state.for_branch(),
            );
            contexts.push(sub_ctx);
            handles.push(ScopedTask::spawn(scope.run()));
        }

        let outcomes: Vec<ScopeOutcome> = join_all(handles)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    ScopeOutcome::failed(EngineError::TaskJoin(e.to_string()).to_string())
                })
            })
            .collect();
        for sub_ctx in &contexts {
            sub_ctx.release().await;
        }

        let mut executed = HashSet::new();
        let mut ports = PortValues::new();
        let mut target_reached = false;
        for outcome in &outcomes {
            executed.extend(outcome.executed.iter().cloned());
            ports.merge_outputs(&outcome.ports);
            target_reached |= outcome.target_reached;
        }

        let failed = outcomes.iter().find(|o| o.state == RunState::Failed);
        let (state, error) = match failed {
            Some(outcome) => (RunState::Failed, outcome.error.clone()),
            None if outcomes.iter().any(|o| o.state == RunState::Stopped) => (RunState::Stopped, None),
            None => (RunState::Completed, None),
        };

        ScopeOutcome {
            state,
            error,
            executed,
            ports,
            variables: ctx.variables().snapshot().await,
            target_reached,
        }
    }

    /// Execute one node on its own, with inputs taken from cached outputs of
    /// previous runs
    #[instrument(skip(self), fields(workflow = %self.graph.name()))]
    pub async fn run_single_node(&mut self, node_id: &str) -> Result<RunSummary, EngineError> {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let graph = self.graph.clone();
        let node = match graph.require(node_id) {
            Ok(node) => node,
            Err(e) => return Err(self.structural_error(&run_id, e)),
        };

        self.state = RunState::Running;
        let ctx = self.build_context(&run_id);
        self.bus.publish(
            WorkflowEvent::new(EventType::WorkflowStarted, &run_id).with_counts(0, 1),
        );

        let resolver = VariableResolver::new(&graph);
        let invocation = resolver.prepare(node, &ctx, &mut self.port_cache).await;
        let executor = NodeExecutor::new(&self.bus, &run_id, self.settings.node_timeout);
        let result = executor
            .execute(node, invocation, &ctx, &mut self.port_cache, false, Some(100.0))
            .await;
        resolver.validate_output_ports(node, &result);
        ctx.release().await;

        let (state, error, executed_nodes) = if result.success {
            (RunState::Completed, None, HashSet::from([node_id.to_string()]))
        } else {
            (RunState::Failed, Some(result.error_message()), HashSet::new())
        };
        self.state = state;
        self.publish_terminal(&run_id, state, error.clone(), executed_nodes.len(), 1);

        Ok(RunSummary {
            run_id,
            success: result.success,
            state,
            executed_nodes,
            total_nodes: 1,
            error,
            variables: ctx.variables().snapshot().await,
            duration: started.elapsed(),
        })
    }

    pub async fn execute_single_node(&mut self, node_id: &str) -> bool {
        match self.run_single_node(node_id).await {
            Ok(summary) => summary.success,
            Err(e) => {
                error!(node_id, "Node could not run: {}", e);
                false
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn build_context(&self, run_id: &str) -> ExecutionContext {
        let ctx = ExecutionContext::new(self.variables.clone())
            .with_run_id(run_id)
            .with_pause_signal(self.pause.clone());
        match &self.resource {
            Some(resource) => ctx.with_resource(resource.clone()),
            None => ctx,
        }
    }

    fn structural_error(&mut self, run_id: &str, error: EngineError) -> EngineError {
        error!(run_id, "{}", error);
        self.stop.reset();
        self.state = RunState::Failed;
        self.bus.publish(
            WorkflowEvent::new(EventType::WorkflowError, run_id)
                .with_error(error.to_string())
                .with_counts(0, self.graph.len()),
        );
        error
    }

    fn publish_terminal(
        &self,
        run_id: &str,
        state: RunState,
        error: Option<String>,
        executed: usize,
        total: usize,
    ) {
        let event = match state {
            RunState::Completed => {
                info!(run_id, executed, total, "Workflow completed");
                WorkflowEvent::new(EventType::WorkflowCompleted, run_id)
            }
            RunState::Failed => {
                let message = error.unwrap_or_else(|| "workflow failed".to_string());
                error!(run_id, executed, total, "Workflow failed: {}", message);
                WorkflowEvent::new(EventType::WorkflowError, run_id).with_error(message)
            }
            other => {
                warn!(run_id, executed, total, state = %other, "Workflow stopped");
                WorkflowEvent::new(EventType::WorkflowStopped, run_id)
            }
        };
        self.bus.publish(event.with_counts(executed, total));
    }
}

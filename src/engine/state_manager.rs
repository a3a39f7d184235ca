//! Execution State Manager - run lifecycle, executed nodes and progress
//!
//! Owns the state machine of one execution scope:
//!
//! ```text
//! Idle -> Running <-> Paused
//!            |
//!            +-> Completed | Failed | Stopped   (terminal)
//! ```
//!
//! It also tracks which nodes have executed, computes progress, gates the
//! scheduling loop on the shared pause/stop signals and restricts execution
//! to the run-to-node subgraph when a target is configured.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::EngineError;
use super::graph::WorkflowGraph;
use crate::workflow::PauseSignal;

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Stopped | RunState::Completed | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Stopped => "stopped",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Cooperative stop request shared by every scope of a run
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Clear a request once the run it targeted has finished
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// State for one execution scope (the top-level run, a fork branch or a
/// foreach item)
#[derive(Debug)]
pub struct ExecutionStateManager {
    state: RunState,
    executed: HashSet<String>,
    total_nodes: usize,
    subgraph: Option<Arc<HashSet<String>>>,
    target: Option<String>,
    target_reached: bool,
    error: Option<String>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    stop: StopSignal,
    pause: PauseSignal,
}

impl ExecutionStateManager {
    pub fn new(total_nodes: usize, stop: StopSignal, pause: PauseSignal) -> Self {
        Self {
            state: RunState::Idle,
            executed: HashSet::new(),
            total_nodes,
            subgraph: None,
            target: None,
            target_reached: false,
            error: None,
            started_at: None,
            finished_at: None,
            stop,
            pause,
        }
    }

    /// `Idle -> Running`; resets the executed set and timers
    pub fn start_execution(&mut self) {
        if self.state != RunState::Idle {
            warn!(state = %self.state, "start_execution called on a used state manager");
        }
        self.state = RunState::Running;
        self.executed.clear();
        self.target_reached = false;
        self.error = None;
        self.started_at = Some(Instant::now());
        self.finished_at = None;
    }

    /// Restrict execution to nodes on a path from a start node to `target`
    pub fn configure_target(
        &mut self,
        graph: &WorkflowGraph,
        start_nodes: &[String],
        target: &str,
    ) -> Result<(), EngineError> {
        if !graph.contains(target) {
            return Err(EngineError::TargetNotFound(target.to_string()));
        }
        let subgraph: HashSet<String> = start_nodes
            .iter()
            .flat_map(|start| graph.path_nodes(start, target))
            .collect();
        if subgraph.is_empty() {
            return Err(EngineError::TargetUnreachable(target.to_string()));
        }
        debug!(target, nodes = subgraph.len(), "Configured run-to-node subgraph");
        self.target = Some(target.to_string());
        self.subgraph = Some(Arc::new(subgraph));
        Ok(())
    }

    /// State for a fork branch or foreach item: same target, same signals,
    /// a copy of the executed set
    pub fn for_branch(&self) -> Self {
        Self {
            state: RunState::Running,
            executed: self.executed.clone(),
            total_nodes: self.total_nodes,
            subgraph: self.subgraph.clone(),
            target: self.target.clone(),
            target_reached: false,
            error: None,
            started_at: Some(Instant::now()),
            finished_at: None,
            stop: self.stop.clone(),
            pause: self.pause.clone(),
        }
    }

    // ========================================================================
    // Pause / stop gating
    // ========================================================================

    /// Suspension point checked once per queue iteration.
    ///
    /// Blocks while paused; returns `false` once a stop has been requested
    /// (including one issued while paused).
    pub async fn pause_checkpoint(&mut self) -> bool {
        if self.stop.is_stopped() {
            self.stop();
            return false;
        }
        if self.state.is_terminal() {
            return false;
        }
        if !self.pause.is_paused() {
            return true;
        }

        if self.state == RunState::Running {
            self.state = RunState::Paused;
            info!("Execution paused");
        }

        let mut pause_rx = self.pause.subscribe();
        let mut stop_rx = self.stop.subscribe();
        loop {
            if *stop_rx.borrow_and_update() {
                self.stop();
                return false;
            }
            if !*pause_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = pause_rx.changed() => {}
                _ = stop_rx.changed() => {}
            }
        }

        if self.state == RunState::Paused {
            self.state = RunState::Running;
            info!("Execution resumed");
        }
        true
    }

    /// Whether the scheduling loop must halt
    pub fn should_stop(&self) -> bool {
        self.stop.is_stopped() || self.state.is_terminal()
    }

    // ========================================================================
    // Executed nodes
    // ========================================================================

    pub fn mark_node_executed(&mut self, node_id: &str) {
        self.executed.insert(node_id.to_string());
    }

    /// Clear executed markers so nodes become eligible again (loop-back)
    pub fn unmark_nodes<'a>(&mut self, node_ids: impl IntoIterator<Item = &'a String>) {
        for id in node_ids {
            self.executed.remove(id);
        }
    }

    pub fn is_executed(&self, node_id: &str) -> bool {
        self.executed.contains(node_id)
    }

    pub fn executed_nodes(&self) -> &HashSet<String> {
        &self.executed
    }

    pub fn merge_executed<'a>(&mut self, node_ids: impl IntoIterator<Item = &'a String>) {
        self.executed.extend(node_ids.into_iter().cloned());
    }

    /// Whether a node lies inside the run-to-node subgraph (always true
    /// without a target)
    pub fn should_execute_node(&self, node_id: &str) -> bool {
        self.subgraph
            .as_ref()
            .map(|nodes| nodes.contains(node_id))
            .unwrap_or(true)
    }

    /// Record that `node_id` executed; true if it is the configured target
    pub fn mark_target_reached(&mut self, node_id: &str) -> bool {
        if self.target.as_deref() == Some(node_id) {
            info!(node_id, "Target node reached");
            self.target_reached = true;
        }
        self.target_reached
    }

    pub fn target_reached(&self) -> bool {
        self.target_reached
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    // ========================================================================
    // Terminal transitions
    // ========================================================================

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.error = Some(message.into());
        self.state = RunState::Failed;
        self.finished_at = Some(Instant::now());
    }

    pub fn mark_completed(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = RunState::Completed;
        self.finished_at = Some(Instant::now());
    }

    /// Idempotent; safe from any state
    pub fn stop(&mut self) {
        self.stop.stop();
        if self.state.is_terminal() {
            return;
        }
        self.state = RunState::Stopped;
        self.finished_at = Some(Instant::now());
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn executed_count(&self) -> usize {
        self.executed.len()
    }

    pub fn total_nodes(&self) -> usize {
        self.total_nodes
    }

    /// `executed / total * 100`; drops after a loop-back clears body nodes
    pub fn calculate_progress(&self) -> f64 {
        Self::progress_of(self.executed.len(), self.total_nodes)
    }

    /// Progress as it will be once `node_id` is marked executed
    pub fn projected_progress(&self, node_id: &str) -> f64 {
        let executed = self.executed.len() + usize::from(!self.executed.contains(node_id));
        Self::progress_of(executed, self.total_nodes)
    }

    fn progress_of(executed: usize, total: usize) -> f64 {
        if total == 0 {
            return 100.0;
        }
        (executed.min(total) as f64 / total as f64) * 100.0
    }

    pub fn elapsed(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(total: usize) -> ExecutionStateManager {
        ExecutionStateManager::new(total, StopSignal::new(), PauseSignal::new())
    }

    #[test]
    fn test_lifecycle() {
        let mut state = manager(4);
        assert_eq!(state.state(), RunState::Idle);

        state.start_execution();
        assert_eq!(state.state(), RunState::Running);

        state.mark_completed();
        assert_eq!(state.state(), RunState::Completed);

        // Terminal states do not change
        state.mark_failed("late failure");
        state.stop();
        assert_eq!(state.state(), RunState::Completed);
        assert!(state.error().is_none());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut state = manager(1);
        state.start_execution();
        state.stop();
        state.stop();
        assert_eq!(state.state(), RunState::Stopped);
        assert!(state.should_stop());
    }

    #[test]
    fn test_progress_regresses_after_unmark() {
        let mut state = manager(4);
        state.start_execution();
        state.mark_node_executed("a");
        state.mark_node_executed("b");
        assert_eq!(state.calculate_progress(), 50.0);
        assert_eq!(state.projected_progress("c"), 75.0);
        assert_eq!(state.projected_progress("a"), 50.0);

        state.unmark_nodes(&["b".to_string()]);
        assert_eq!(state.calculate_progress(), 25.0);
        assert!(state.is_executed("a"));
        assert!(!state.is_executed("b"));
    }

    #[test]
    fn test_target_reached() {
        let mut state = manager(2);
        state.target = Some("t".to_string());
        assert!(!state.mark_target_reached("x"));
        assert!(state.mark_target_reached("t"));
        assert!(state.target_reached());
    }

    #[tokio::test]
    async fn test_checkpoint_passes_when_running() {
        let mut state = manager(1);
        state.start_execution();
        assert!(state.pause_checkpoint().await);
        assert_eq!(state.state(), RunState::Running);
    }

    #[tokio::test]
    async fn test_stop_while_paused() {
        let pause = PauseSignal::new();
        let stop = StopSignal::new();
        let mut state = ExecutionStateManager::new(1, stop.clone(), pause.clone());
        state.start_execution();
        pause.pause();

        let handle = tokio::spawn(async move {
            let proceed = state.pause_checkpoint().await;
            (proceed, state.state())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.stop();

        let (proceed, final_state) = handle.await.unwrap();
        assert!(!proceed);
        assert_eq!(final_state, RunState::Stopped);
    }

    #[tokio::test]
    async fn test_resume_after_pause() {
        let pause = PauseSignal::new();
        let mut state = ExecutionStateManager::new(1, StopSignal::new(), pause.clone());
        state.start_execution();
        pause.pause();

        let handle = tokio::spawn(async move {
            let proceed = state.pause_checkpoint().await;
            (proceed, state.state())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pause.resume();

        let (proceed, final_state) = handle.await.unwrap();
        assert!(proceed);
        assert_eq!(final_state, RunState::Running);
    }
}

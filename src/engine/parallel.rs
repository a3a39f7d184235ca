//! Fork/join and parallel foreach sub-executions
//!
//! Each fork branch and each foreach item runs as its own [`Scope`] on an
//! isolated copy of the parent context. The spawning scope keeps the returned
//! handle and folds the report back once every unit has finished.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{join_all, select_all};
use serde_json::{json, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

use super::orchestrator::ForkPlan;
use super::result::ForeachBatch;
use super::scheduler::{RunShared, Scope, ScopeOutcome, SubRunReport};
use super::state_manager::ExecutionStateManager;
use super::variable_resolver::PortValues;
use crate::workflow::{ExecutionContext, ExecutionSettings};

/// Outcome of one fork branch
#[derive(Debug)]
pub(crate) struct BranchRun {
    pub branch: String,
    pub outcome: ScopeOutcome,
}

#[derive(Debug)]
pub(crate) struct ForkReport {
    pub branches: Vec<BranchRun>,
}

/// Outcome of one foreach item
#[derive(Debug)]
pub(crate) struct ItemRun {
    pub index: usize,
    pub item: Value,
    pub success: bool,
    /// The item scope's `result` variable
    pub result: Value,
    pub error: Option<String>,
    /// `None` when the item timed out or its task died
    pub outcome: Option<ScopeOutcome>,
}

#[derive(Debug)]
pub(crate) struct BatchReport {
    pub items: Vec<ItemRun>,
}

/// A spawned sub-execution owned by the scope that started it.
///
/// Dropping the guard aborts the task, so a cancelled or timed-out scope takes
/// its nested forks and batches down with it.
#[derive(Debug)]
pub(crate) struct ScopedTask<T>(JoinHandle<T>);

impl<T: Send + 'static> ScopedTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl<T> ScopedTask<T> {
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    pub fn abort(&self) {
        self.0.abort();
    }
}

impl<T> Future for ScopedTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for ScopedTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn concurrency_limit(settings: &ExecutionSettings) -> Option<Arc<Semaphore>> {
    (settings.max_parallel > 0).then(|| Arc::new(Semaphore::new(settings.max_parallel)))
}

async fn acquire(limit: &Option<Arc<Semaphore>>) -> Option<OwnedSemaphorePermit> {
    match limit {
        Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
        None => None,
    }
}

fn flatten(joined: Result<ScopeOutcome, JoinError>) -> ScopeOutcome {
    joined.unwrap_or_else(|e| ScopeOutcome::failed(format!("branch task failed: {}", e)))
}

// ============================================================================
// Fork / join
// ============================================================================

/// Start every branch of a fork; the handle resolves once all branches have
/// finished (or, with `fail_fast`, once the first one fails)
pub(crate) async fn spawn_fork(
    shared: Arc<RunShared>,
    plan: &ForkPlan,
    ctx: &ExecutionContext,
    state: &ExecutionStateManager,
    ports: &PortValues,
) -> ScopedTask<SubRunReport> {
    let clone_resource = shared.settings.isolate_branch_resources;
    let limit = concurrency_limit(&shared.settings);

    // Snapshot contexts now, not when the task first runs
    let mut branches = Vec::with_capacity(plan.branches.len());
    for (port, entry) in &plan.branches {
        if entry.is_empty() {
            debug!(fork_id = %plan.fork_id, branch = %port, "Branch port has no connection");
        }
        let branch_ctx = ctx.isolated(clone_resource).await;
        let scope = Scope::branch(
            shared.clone(),
            entry.clone(),
            branch_ctx.clone(),
            ports.clone(),
            state.for_branch(),
            plan.join_id.clone(),
        );
        branches.push((port.clone(), branch_ctx, scope));
    }
    let fail_fast = plan.fail_fast;

    ScopedTask::spawn(async move {
        let mut labels = Vec::with_capacity(branches.len());
        let mut contexts = Vec::with_capacity(branches.len());
        let mut handles = Vec::with_capacity(branches.len());
        for (port, branch_ctx, scope) in branches {
            labels.push(port);
            contexts.push(branch_ctx);
            let limit = limit.clone();
            handles.push(ScopedTask::spawn(async move {
                let _permit = acquire(&limit).await;
                scope.run().await
            }));
        }

        let outcomes = if fail_fast {
            join_fail_fast(handles).await
        } else {
            join_all(handles).await.into_iter().map(flatten).collect()
        };

        for branch_ctx in &contexts {
            branch_ctx.release().await;
        }

        SubRunReport::Fork(ForkReport {
            branches: labels
                .into_iter()
                .zip(outcomes)
                .map(|(branch, outcome)| BranchRun { branch, outcome })
                .collect(),
        })
    })
}

/// Wait for branches in completion order; the first failure aborts the rest
async fn join_fail_fast(handles: Vec<ScopedTask<ScopeOutcome>>) -> Vec<ScopeOutcome> {
    let mut outcomes: Vec<Option<ScopeOutcome>> = (0..handles.len()).map(|_| None).collect();
    let mut pending: Vec<(usize, ScopedTask<ScopeOutcome>)> = handles.into_iter().enumerate().collect();

    while !pending.is_empty() {
        let (joined, pos, _) = select_all(pending.iter_mut().map(|(_, handle)| handle)).await;
        let (index, _) = pending.remove(pos);
        let outcome = flatten(joined);
        let failed = !outcome.success();
        outcomes[index] = Some(outcome);

        if failed {
            warn!(remaining = pending.len(), "Branch failed, cancelling remaining branches");
            for (index, handle) in pending.drain(..) {
                handle.abort();
                outcomes[index] = Some(ScopeOutcome::failed("cancelled"));
            }
        }
    }

    outcomes
        .into_iter()
        .map(|o| o.unwrap_or_else(|| ScopeOutcome::failed("cancelled")))
        .collect()
}

// ============================================================================
// Parallel foreach
// ============================================================================

/// Start one scope per item of a batch, each bounded by the item timeout
pub(crate) async fn spawn_batch(
    shared: Arc<RunShared>,
    batch: &ForeachBatch,
    ctx: &ExecutionContext,
    state: &ExecutionStateManager,
    ports: &PortValues,
) -> ScopedTask<SubRunReport> {
    let graph = shared.graph.clone();
    let entry = graph.exec_targets(&batch.node_id, &batch.body_port);
    let body = graph.reachable_from_port(&batch.node_id, &batch.body_port, &[batch.node_id.as_str()]);
    let timeout = batch
        .item_timeout
        .unwrap_or(shared.settings.foreach_item_timeout);
    let clone_resource = shared.settings.isolate_branch_resources;
    let limit = concurrency_limit(&shared.settings);

    let mut items = Vec::with_capacity(batch.items.len());
    for (offset, item) in batch.items.iter().enumerate() {
        let index = batch.start_index + offset;
        let item_ctx = ctx.isolated(clone_resource).await;
        item_ctx.set_variable("current_item", item.clone()).await;
        item_ctx.set_variable("current_index", json!(index)).await;

        // Body nodes run once per item, whatever earlier items did
        let mut item_state = state.for_branch();
        item_state.unmark_nodes(body.iter());

        let scope = Scope::branch(
            shared.clone(),
            entry.clone(),
            item_ctx.clone(),
            ports.clone(),
            item_state,
            Some(batch.node_id.clone()),
        );
        items.push((index, item.clone(), item_ctx, scope));
    }

    ScopedTask::spawn(async move {
        let mut meta = Vec::with_capacity(items.len());
        let mut handles = Vec::with_capacity(items.len());
        for (index, item, item_ctx, scope) in items {
            meta.push((index, item.clone()));
            let limit = limit.clone();
            handles.push(ScopedTask::spawn(async move {
                let _permit = acquire(&limit).await;
                let run = tokio::time::timeout(timeout, scope.run()).await;
                item_ctx.release().await;

                match run {
                    Ok(outcome) => ItemRun {
                        index,
                        item,
                        success: outcome.success(),
                        result: outcome.variables.get("result").cloned().unwrap_or(Value::Null),
                        error: outcome.error.clone(),
                        outcome: Some(outcome),
                    },
                    Err(_) => {
                        warn!(index, ?timeout, "Foreach item timed out");
                        ItemRun {
                            index,
                            item,
                            success: false,
                            result: Value::Null,
                            error: Some("timeout".to_string()),
                            outcome: None,
                        }
                    }
                }
            }));
        }

        let items = join_all(handles)
            .await
            .into_iter()
            .zip(meta)
            .map(|(joined, (index, item))| {
                joined.unwrap_or_else(|e| ItemRun {
                    index,
                    item,
                    success: false,
                    result: Value::Null,
                    error: Some(format!("item task failed: {}", e)),
                    outcome: None,
                })
            })
            .collect();

        SubRunReport::Batch(BatchReport { items })
    })
}

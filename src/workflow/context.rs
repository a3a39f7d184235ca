//! Execution context for workflow runtime
//!
//! This module contains the runtime context handed to every task body:
//! the variable store, the resource handle, the pause signal and the
//! transient per-node state used by loop and try/catch nodes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Plain variable map
pub type VariableMap = HashMap<String, Value>;

// ============================================================================
// Variables
// ============================================================================

/// Variable store shared by reference between clones
///
/// Cloning a `Variables` shares the underlying map. Use [`Variables::isolated`]
/// to get an independent copy.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    inner: Arc<RwLock<VariableMap>>,
}

impl Variables {
    pub fn new(initial: VariableMap) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn get(&self, name: &str) -> Option<Value> {
        self.inner.read().await.get(name).cloned()
    }

    pub async fn set(&self, name: &str, value: Value) {
        self.inner.write().await.insert(name.to_string(), value);
    }

    pub async fn remove(&self, name: &str) -> Option<Value> {
        self.inner.write().await.remove(name)
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.read().await.contains_key(name)
    }

    /// Copy of the current map
    pub async fn snapshot(&self) -> VariableMap {
        self.inner.read().await.clone()
    }

    /// Independent copy; writes to the copy are not visible here
    pub async fn isolated(&self) -> Self {
        Self::new(self.snapshot().await)
    }

    /// Whether two stores share the same underlying map
    pub fn shares_with(&self, other: &Variables) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ============================================================================
// Resources
// ============================================================================

/// Opaque resource owned by an execution scope (browser session, connection, ...)
#[async_trait]
pub trait ResourceHandle: Send + Sync + fmt::Debug {
    /// Create an independently owned handle of the same kind
    fn duplicate(&self) -> Arc<dyn ResourceHandle>;

    /// Release the underlying resource. Called once when the owning scope ends.
    async fn release(&self) {}
}

// ============================================================================
// Pause signal
// ============================================================================

/// Host-supplied pause switch shared by every scope of a run
#[derive(Debug, Clone)]
pub struct PauseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for PauseSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Captured errors
// ============================================================================

/// Error recorded by the driver for a `catch` node to pick up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedError {
    pub message: String,
    pub error_type: String,
    pub node_id: String,
}

// ============================================================================
// ExecutionContext
// ============================================================================

/// Runtime context for a single execution scope
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Run ID
    pub run_id: String,

    variables: Variables,
    resource: Option<Arc<dyn ResourceHandle>>,
    owns_resource: bool,
    pause: PauseSignal,

    /// Transient per-node state (loop iteration state), keyed by node id
    node_state: Arc<RwLock<HashMap<String, Value>>>,

    /// Errors waiting for a catch node, keyed by try node id
    captured_errors: Arc<RwLock<HashMap<String, CapturedError>>>,
}

impl ExecutionContext {
    /// Create a new execution context with a generated run ID
    pub fn new(variables: VariableMap) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            variables: Variables::new(variables),
            resource: None,
            owns_resource: false,
            pause: PauseSignal::new(),
            node_state: Arc::default(),
            captured_errors: Arc::default(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Attach a resource owned by this context
    pub fn with_resource(mut self, resource: Arc<dyn ResourceHandle>) -> Self {
        self.resource = Some(resource);
        self.owns_resource = true;
        self
    }

    pub fn with_pause_signal(mut self, pause: PauseSignal) -> Self {
        self.pause = pause;
        self
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub async fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name).await
    }

    pub async fn set_variable(&self, name: &str, value: Value) {
        self.variables.set(name, value).await;
    }

    pub fn resource(&self) -> Option<&Arc<dyn ResourceHandle>> {
        self.resource.as_ref()
    }

    pub fn owns_resource(&self) -> bool {
        self.owns_resource
    }

    pub fn pause_signal(&self) -> &PauseSignal {
        &self.pause
    }

    /// Get transient state stored for a node
    pub async fn node_state(&self, node_id: &str) -> Option<Value> {
        self.node_state.read().await.get(node_id).cloned()
    }

    pub async fn set_node_state(&self, node_id: &str, state: Value) {
        self.node_state
            .write()
            .await
            .insert(node_id.to_string(), state);
    }

    pub async fn clear_node_state(&self, node_id: &str) {
        self.node_state.write().await.remove(node_id);
    }

    pub async fn capture_error(&self, try_node_id: &str, error: CapturedError) {
        self.captured_errors
            .write()
            .await
            .insert(try_node_id.to_string(), error);
    }

    /// Take (and remove) the error captured for a try scope
    pub async fn take_captured_error(&self, try_node_id: &str) -> Option<CapturedError> {
        self.captured_errors.write().await.remove(try_node_id)
    }

    /// Context for a fork branch or foreach item.
    ///
    /// Variables and node state are copied, captured errors start empty. The
    /// resource handle is shared unless `clone_resource` is set, in which case
    /// the new context owns a duplicate.
    pub async fn isolated(&self, clone_resource: bool) -> Self {
        let node_state = self.node_state.read().await.clone();
        let (resource, owns_resource) = match (&self.resource, clone_resource) {
            (Some(r), true) => (Some(r.duplicate()), true),
            (r, _) => (r.clone(), false),
        };
        Self {
            run_id: self.run_id.clone(),
            variables: self.variables.isolated().await,
            resource,
            owns_resource,
            pause: self.pause.clone(),
            node_state: Arc::new(RwLock::new(node_state)),
            captured_errors: Arc::default(),
        }
    }

    /// Context for a concurrent top-level workflow.
    ///
    /// The variable map is shared by reference; the resource handle is
    /// duplicated so each workflow owns its own.
    pub fn shared_with_own_resource(&self) -> Self {
        let resource = self.resource.as_ref().map(|r| r.duplicate());
        Self {
            run_id: self.run_id.clone(),
            variables: self.variables.clone(),
            owns_resource: resource.is_some(),
            resource,
            pause: self.pause.clone(),
            node_state: Arc::default(),
            captured_errors: Arc::default(),
        }
    }

    /// Release the resource if this context owns it
    pub async fn release(&self) {
        if self.owns_resource {
            if let Some(resource) = &self.resource {
                resource.release().await;
            }
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(VariableMap::new())
    }
}

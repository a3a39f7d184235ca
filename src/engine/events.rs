//! Lifecycle events
//!
//! The engine publishes one [`WorkflowEvent`] per lifecycle transition to an
//! [`EventBus`] that the host constructs and injects. Delivery is
//! fire-and-forget: a subscriber that errors or panics is logged and skipped,
//! never propagated back into the run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Kind of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowStarted,
    NodeStarted,
    NodeCompleted,
    NodeError,
    NodeSkipped,
    WorkflowProgress,
    WorkflowCompleted,
    WorkflowError,
    WorkflowStopped,
}

impl EventType {
    /// Terminal summary events; exactly one is published per run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::WorkflowCompleted | EventType::WorkflowError | EventType::WorkflowStopped
        )
    }
}

/// A published lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub event_type: EventType,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
}

impl WorkflowEvent {
    pub fn new(event_type: EventType, run_id: &str) -> Self {
        Self {
            event_type,
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            node_id: None,
            error: None,
            progress: None,
            executed_count: None,
            total_count: None,
        }
    }

    pub fn node(event_type: EventType, run_id: &str, node_id: &str) -> Self {
        Self::new(event_type, run_id).with_node(node_id)
    }

    pub fn with_node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_counts(mut self, executed: usize, total: usize) -> Self {
        self.executed_count = Some(executed);
        self.total_count = Some(total);
        self
    }
}

// ============================================================================
// Subscribers
// ============================================================================

/// Receiver of lifecycle events
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &WorkflowEvent) -> anyhow::Result<()>;
}

impl<F> EventSubscriber for F
where
    F: Fn(&WorkflowEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &WorkflowEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Forwards events into an unbounded channel for async consumers
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    sender: async_channel::Sender<WorkflowEvent>,
}

impl ChannelSubscriber {
    pub fn new(sender: async_channel::Sender<WorkflowEvent>) -> Self {
        Self { sender }
    }
}

impl EventSubscriber for ChannelSubscriber {
    fn on_event(&self, event: &WorkflowEvent) -> anyhow::Result<()> {
        // Receiver may have been dropped
        let _ = self.sender.try_send(event.clone());
        Ok(())
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    filter: Option<EventType>,
    subscriber: Arc<dyn EventSubscriber>,
}

#[derive(Default)]
struct Subscriptions {
    next_id: u64,
    entries: Vec<Subscription>,
}

// ============================================================================
// EventBus
// ============================================================================

/// Event bus with explicit lifecycle; construct one per host (or per test)
#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<Subscriptions>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event
    pub fn subscribe(&self, subscriber: impl EventSubscriber + 'static) -> SubscriptionId {
        self.add(None, Arc::new(subscriber))
    }

    /// Subscribe to a single event type
    pub fn subscribe_to(
        &self,
        event_type: EventType,
        subscriber: impl EventSubscriber + 'static,
    ) -> SubscriptionId {
        self.add(Some(event_type), Arc::new(subscriber))
    }

    /// Subscribe through an unbounded channel
    pub fn channel(&self) -> async_channel::Receiver<WorkflowEvent> {
        let (tx, rx) = async_channel::unbounded();
        self.subscribe(ChannelSubscriber::new(tx));
        rx
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subs.entries.len();
        subs.entries.retain(|s| s.id != id);
        subs.entries.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entries
            .len()
    }

    /// Deliver an event to every matching subscriber
    pub fn publish(&self, event: WorkflowEvent) {
        // Snapshot so subscribers may (un)subscribe from inside a callback
        let targets: Vec<Arc<dyn EventSubscriber>> = {
            let subs = self
                .subscriptions
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subs.entries
                .iter()
                .filter(|s| s.filter.map_or(true, |t| t == event.event_type))
                .map(|s| s.subscriber.clone())
                .collect()
        };

        for subscriber in targets {
            match catch_unwind(AssertUnwindSafe(|| subscriber.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    event_type = ?event.event_type,
                    "Event subscriber failed: {}", e
                ),
                Err(_) => warn!(event_type = ?event.event_type, "Event subscriber panicked"),
            }
        }
    }

    fn add(&self, filter: Option<EventType>, subscriber: Arc<dyn EventSubscriber>) -> SubscriptionId {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = SubscriptionId(subs.next_id);
        subs.next_id += 1;
        subs.entries.push(Subscription {
            id,
            filter,
            subscriber,
        });
        id
    }
}

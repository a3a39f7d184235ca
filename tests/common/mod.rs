#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nodeflow::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

// ============================================================================
// Files
// ============================================================================

pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

pub fn write_workflow(dir: &Path, filename: &str, content: &str) -> PathBuf {
    let path = dir.join(filename);
    fs::write(&path, content).expect("Failed to write workflow file");
    path
}

pub fn linear_workflow_yaml(name: &str) -> String {
    format!(
        r#"
name: {}
nodes:
  - id: start
    type: start
  - id: greet
    type: set_variable
    config:
      name: greeting
      value: hello
  - id: end
    type: end
connections:
  - from: start.exec_out
    to: greet.exec_in
  - from: greet.exec_out
    to: end.exec_in
"#,
        name
    )
}

pub fn failing_workflow_yaml(name: &str) -> String {
    format!(
        r#"
name: {}
nodes:
  - id: start
    type: start
  - id: explode
    type: raise_error
    config:
      message: disk full
connections:
  - from: start.exec_out
    to: explode.exec_in
"#,
        name
    )
}

// ============================================================================
// Task bodies
// ============================================================================

/// Records every execution as `(node_id, value)`
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn nodes(&self) -> Vec<String> {
        self.calls().into_iter().map(|(id, _)| id).collect()
    }

    pub fn count(&self, node_id: &str) -> usize {
        self.calls().iter().filter(|(id, _)| id == node_id).count()
    }

    pub fn values(&self, node_id: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| id == node_id)
            .map(|(_, v)| v)
            .collect()
    }
}

/// `record`: optional `sleep_ms`, records `value`
pub struct RecordTask {
    recorder: Recorder,
}

#[async_trait]
impl TaskBody for RecordTask {
    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::exec("exec_out"),
            PortDefinition::data("value", DataType::Any),
        ]
    }

    async fn execute(&self, node: &NodeInvocation, _ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        if let Some(ms) = node.param_u64("sleep_ms") {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        let value = node.param("value").cloned().unwrap_or(Value::Null);
        self.recorder
            .calls
            .lock()
            .unwrap()
            .push((node.node_id.clone(), value.clone()));
        Ok(ExecutionResult::ok().with_data("value", value))
    }
}

/// `fail`: optional `sleep_ms`, then fails with `message`
#[derive(Default)]
pub struct FailTask;

#[async_trait]
impl TaskBody for FailTask {
    async fn execute(&self, node: &NodeInvocation, _ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        if let Some(ms) = node.param_u64("sleep_ms") {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        anyhow::bail!("{}", node.param_str("message").unwrap_or("boom"))
    }
}

/// `sleep`: waits `ms` milliseconds
#[derive(Default)]
pub struct SleepTask;

#[async_trait]
impl TaskBody for SleepTask {
    async fn execute(&self, node: &NodeInvocation, _ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        let ms = node.param_u64("ms").unwrap_or(10);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ExecutionResult::ok())
    }
}

/// `item`: foreach body; stores `current_item` as `result`, fails on `reject`
#[derive(Default)]
pub struct ItemTask;

#[async_trait]
impl TaskBody for ItemTask {
    async fn execute(&self, node: &NodeInvocation, ctx: &ExecutionContext) -> anyhow::Result<ExecutionResult> {
        let item = ctx.get_variable("current_item").await.unwrap_or(Value::Null);
        if node.param("reject") == Some(&item) {
            anyhow::bail!("rejected {}", item);
        }
        ctx.set_variable("result", item).await;
        Ok(ExecutionResult::ok())
    }
}

/// Builtins plus the test task bodies above
pub fn registry(recorder: &Recorder) -> TaskRegistry {
    let mut registry = TaskRegistry::with_builtins();
    registry
        .register_instance(
            "record",
            Arc::new(RecordTask {
                recorder: recorder.clone(),
            }),
        )
        .register_default::<FailTask>("fail")
        .register_default::<SleepTask>("sleep")
        .register_default::<ItemTask>("item");
    registry
}

/// Resource that counts duplicates and releases
#[derive(Debug, Default)]
pub struct CountingResource {
    pub duplicates: Arc<AtomicUsize>,
    pub releases: Arc<AtomicUsize>,
}

impl CountingResource {
    pub fn duplicates(&self) -> usize {
        self.duplicates.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceHandle for CountingResource {
    fn duplicate(&self) -> Arc<dyn ResourceHandle> {
        self.duplicates.fetch_add(1, Ordering::SeqCst);
        Arc::new(CountingResource {
            duplicates: self.duplicates.clone(),
            releases: self.releases.clone(),
        })
    }

    async fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Executors and events
// ============================================================================

pub struct Harness {
    pub executor: WorkflowExecutor,
    pub events: async_channel::Receiver<WorkflowEvent>,
    pub recorder: Recorder,
}

pub fn harness(definition: &WorkflowDefinition) -> Harness {
    let recorder = Recorder::default();
    let bus = Arc::new(EventBus::new());
    let events = bus.channel();
    let executor = WorkflowExecutor::from_definition(definition, &registry(&recorder), bus)
        .expect("Failed to build workflow graph");
    Harness {
        executor,
        events,
        recorder,
    }
}

pub fn drain(events: &async_channel::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

pub fn count_events(events: &[WorkflowEvent], event_type: EventType, node_id: Option<&str>) -> usize {
    events
        .iter()
        .filter(|e| e.event_type == event_type)
        .filter(|e| node_id.map_or(true, |id| e.node_id.as_deref() == Some(id)))
        .count()
}

pub fn terminal_events(events: &[WorkflowEvent]) -> Vec<EventType> {
    events
        .iter()
        .filter(|e| e.event_type.is_terminal())
        .map(|e| e.event_type)
        .collect()
}

/// Index of the first event matching type and node
pub fn position(events: &[WorkflowEvent], event_type: EventType, node_id: &str) -> Option<usize> {
    events
        .iter()
        .position(|e| e.event_type == event_type && e.node_id.as_deref() == Some(node_id))
}

pub fn node(id: &str, node_type: &str) -> NodeDefinition {
    NodeDefinition::new(id, node_type)
}

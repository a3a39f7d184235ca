mod common;

use std::time::Duration;

use common::*;
use nodeflow::prelude::*;
use serde_json::json;

fn slow_chain() -> WorkflowDefinition {
    WorkflowDefinition::new("slow-chain")
        .node(node("start", "start"))
        .node(node("slow", "sleep").with_config("ms", 100))
        .node(node("a", "record"))
        .node(node("end", "end"))
        .link("start", "slow")
        .link("slow", "a")
        .link("a", "end")
}

#[tokio::test]
async fn test_stop_while_paused() {
    let Harness {
        mut executor,
        events,
        recorder,
    } = harness(&slow_chain());
    let pause = executor.pause_signal();
    let stop = executor.stop_handle();

    let run = tokio::spawn(async move { executor.run(false).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    pause.pause();
    tokio::time::sleep(Duration::from_millis(150)).await;
    stop.stop();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.state, RunState::Stopped);
    assert!(!summary.success);
    assert!(summary.executed("slow"));
    assert_eq!(recorder.count("a"), 0);

    let events = drain(&events);
    assert_eq!(terminal_events(&events), vec![EventType::WorkflowStopped]);
}

#[tokio::test]
async fn test_pause_then_resume_completes() {
    let Harness {
        mut executor,
        events,
        recorder,
    } = harness(&slow_chain());
    let pause = executor.pause_signal();

    let run = tokio::spawn(async move { executor.run(false).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    pause.pause();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(recorder.count("a"), 0);
    pause.resume();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(recorder.count("a"), 1);
    assert_eq!(terminal_events(&drain(&events)), vec![EventType::WorkflowCompleted]);
}

#[tokio::test]
async fn test_stop_mid_run() {
    let Harness {
        mut executor,
        events,
        recorder,
    } = harness(&slow_chain());
    let stop = executor.stop_handle();

    let run = tokio::spawn(async move { executor.run(false).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    stop.stop();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.state, RunState::Stopped);
    assert_eq!(recorder.count("a"), 0);

    let events = drain(&events);
    let stopped = events
        .iter()
        .find(|e| e.event_type == EventType::WorkflowStopped)
        .unwrap();
    assert_eq!(stopped.total_count, Some(4));
}

#[tokio::test]
async fn test_stop_issued_before_run_is_polled() {
    let Harness {
        mut executor,
        events,
        recorder,
    } = harness(&slow_chain());
    executor.pause();
    let stop = executor.stop_handle();

    let run = tokio::spawn(async move { executor.run(false).await });
    stop.stop();

    let summary = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("paused run ignored the stop request")
        .unwrap()
        .unwrap();
    assert_eq!(summary.state, RunState::Stopped);
    assert_eq!(recorder.count("a"), 0);
    assert_eq!(terminal_events(&drain(&events)), vec![EventType::WorkflowStopped]);
}

#[tokio::test]
async fn test_executor_can_run_again_after_stop() {
    let mut h = harness(&slow_chain());
    h.executor.stop();
    let stopped = h.executor.run(false).await.unwrap();
    assert_eq!(stopped.state, RunState::Stopped);
    assert_eq!(h.recorder.count("a"), 0);

    let summary = h.executor.run(false).await.unwrap();
    assert!(summary.success);
    assert_eq!(h.recorder.count("a"), 1);
}

fn fan_out() -> WorkflowDefinition {
    WorkflowDefinition::new("fan-out")
        .node(node("start", "start"))
        .node(node("a", "record"))
        .node(node("b", "record"))
        .node(node("c", "record"))
        .node(node("end", "record"))
        .link("start", "a")
        .link("start", "c")
        .link("a", "b")
        .link("b", "end")
}

#[tokio::test]
async fn test_run_to_target_node() {
    let mut h = harness(&fan_out());
    h.executor = h.executor.with_settings(ExecutionSettings::default().target("b"));
    let summary = h.executor.run(false).await.unwrap();

    assert!(summary.success);
    let mut executed: Vec<_> = summary.executed_nodes.iter().cloned().collect();
    executed.sort();
    assert_eq!(executed, vec!["a", "b", "start"]);
    assert_eq!(h.recorder.count("end"), 0);
    assert_eq!(h.recorder.count("c"), 0);

    let events = drain(&h.events);
    assert_eq!(count_events(&events, EventType::NodeSkipped, Some("c")), 1);
    assert_eq!(terminal_events(&events), vec![EventType::WorkflowCompleted]);
}

#[tokio::test]
async fn test_unknown_target_is_structural_error() {
    let mut h = harness(&fan_out());
    h.executor = h
        .executor
        .with_settings(ExecutionSettings::default().target("nowhere"));

    assert!(h.executor.run(false).await.is_err());
    assert_eq!(h.executor.state(), RunState::Failed);
    assert_eq!(h.recorder.calls().len(), 0);

    let events = drain(&h.events);
    assert_eq!(terminal_events(&events), vec![EventType::WorkflowError]);
    assert_eq!(count_events(&events, EventType::WorkflowStarted, None), 0);
}

#[tokio::test]
async fn test_missing_start_node_is_structural_error() {
    let def = WorkflowDefinition::new("headless")
        .node(node("a", "record"))
        .node(node("b", "record"))
        .link("a", "b")
        .link("b", "a");

    let mut h = harness(&def);
    let err = h.executor.run(false).await.unwrap_err();
    assert!(matches!(err, EngineError::NoStartNode(_)));
    assert!(!h.executor.execute(false).await);

    let events = drain(&h.events);
    let error = events
        .iter()
        .find(|e| e.event_type == EventType::WorkflowError)
        .unwrap();
    assert_eq!(error.executed_count, Some(0));
    assert_eq!(error.total_count, Some(2));
}

fn producer_consumer() -> WorkflowDefinition {
    WorkflowDefinition::new("single")
        .node(node("start", "start"))
        .node(node("produce", "set_variable").with_config("name", "x").with_config("value", 42))
        .node(node("consume", "record"))
        .link("start", "produce")
        .link("produce", "consume")
        .connect("produce", "value", "consume", "value")
}

#[tokio::test]
async fn test_single_node_reuses_cached_outputs() {
    let mut h = harness(&producer_consumer());
    assert!(h.executor.run(false).await.unwrap().success);
    assert_eq!(h.executor.cached_output("produce", "value"), Some(&json!(42)));
    drain(&h.events);

    let summary = h.executor.run_single_node("consume").await.unwrap();
    assert!(summary.success);
    assert_eq!(summary.executed_nodes.len(), 1);
    assert_eq!(h.recorder.values("consume"), vec![json!(42), json!(42)]);
    assert_eq!(h.recorder.count("produce"), 0);

    let events = drain(&h.events);
    let started = events
        .iter()
        .find(|e| e.event_type == EventType::WorkflowStarted)
        .unwrap();
    assert_eq!(started.total_count, Some(1));
    assert_eq!(terminal_events(&events), vec![EventType::WorkflowCompleted]);
}

#[tokio::test]
async fn test_single_node_setting_routes_run() {
    let mut h = harness(&producer_consumer());
    h.executor = h
        .executor
        .with_settings(ExecutionSettings::default().single_node("produce"));

    let summary = h.executor.run(false).await.unwrap();
    assert!(summary.success);
    assert!(summary.executed("produce"));
    assert!(!summary.executed("consume"));
}

#[tokio::test]
async fn test_single_node_unknown_id() {
    let mut h = harness(&producer_consumer());
    assert!(h.executor.run_single_node("ghost").await.is_err());
    assert_eq!(terminal_events(&drain(&h.events)), vec![EventType::WorkflowError]);
}

#[tokio::test]
async fn test_events_reach_subscribers_in_order() {
    let mut h = harness(&producer_consumer());
    h.executor.run(false).await.unwrap();

    let events = drain(&h.events);
    assert_eq!(events.first().map(|e| e.event_type), Some(EventType::WorkflowStarted));
    assert_eq!(events.last().map(|e| e.event_type), Some(EventType::WorkflowCompleted));

    let started = position(&events, EventType::NodeStarted, "produce").unwrap();
    let completed = position(&events, EventType::NodeCompleted, "produce").unwrap();
    let next = position(&events, EventType::NodeStarted, "consume").unwrap();
    assert!(started < completed && completed < next);

    let run_id = &events[0].run_id;
    assert!(events.iter().all(|e| &e.run_id == run_id));
}

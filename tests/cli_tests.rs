mod common;

use common::*;
use std::process::Command;

fn cli_command() -> Command {
    Command::new(env!("CARGO_BIN_EXE_nodeflow"))
}

#[test]
fn test_cli_help() {
    let output = cli_command().arg("--help").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Run node-graph workflows"));
    assert!(stdout.contains("run"));
    assert!(stdout.contains("validate"));
    assert!(stdout.contains("nodes"));
}

#[test]
fn test_cli_version() {
    let output = cli_command().arg("--version").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("nodeflow"));
}

#[test]
fn test_cli_run_help() {
    let output = cli_command().args(["run", "--help"]).output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Run a workflow graph file"));
    assert!(stdout.contains("--target"));
    assert!(stdout.contains("--single"));
    assert!(stdout.contains("--continue-on-error"));
    assert!(stdout.contains("--run-all"));
    assert!(stdout.contains("--var"));
}

#[test]
fn test_cli_nodes_lists_builtins() {
    let output = cli_command().arg("nodes").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for node_type in ["start", "if", "for_loop_start", "try", "catch", "fork", "parallel_foreach"] {
        assert!(stdout.contains(node_type), "missing {}", node_type);
    }
}

#[test]
fn test_cli_validate_valid_workflow() {
    let dir = create_test_dir();
    let path = write_workflow(dir.path(), "ok.yaml", &linear_workflow_yaml("valid-graph"));

    let output = cli_command()
        .args(["validate", path.to_str().unwrap()])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("valid-graph"));
    assert!(stdout.contains("Nodes: 3"));
    assert!(stdout.contains("Start nodes: start"));
}

#[test]
fn test_cli_validate_unknown_type() {
    let dir = create_test_dir();
    let path = write_workflow(
        dir.path(),
        "bad.yaml",
        r#"
name: bad-graph
nodes:
  - id: start
    type: start
  - id: x
    type: teleport
"#,
    );

    let output = cli_command()
        .args(["validate", path.to_str().unwrap()])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("teleport"));
}

#[test]
fn test_cli_run_success() {
    let dir = create_test_dir();
    let path = write_workflow(dir.path(), "ok.yaml", &linear_workflow_yaml("linear"));

    let output = cli_command()
        .args(["run", path.to_str().unwrap()])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("COMPLETED"));
    assert!(stdout.contains("Executed: 3/3 nodes"));
}

#[test]
fn test_cli_run_failure_exit_code() {
    let dir = create_test_dir();
    let path = write_workflow(dir.path(), "fail.yaml", &failing_workflow_yaml("failing"));

    let output = cli_command()
        .args(["run", path.to_str().unwrap()])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("FAILED"));
    assert!(stdout.contains("disk full"));
}

#[test]
fn test_cli_continue_on_error_flag() {
    let dir = create_test_dir();
    let path = write_workflow(dir.path(), "fail.yaml", &failing_workflow_yaml("failing"));

    let output = cli_command()
        .args(["run", path.to_str().unwrap(), "--continue-on-error"])
        .output()
        .unwrap();

    assert!(output.status.success());
}

#[test]
fn test_cli_run_to_target() {
    let dir = create_test_dir();
    let path = write_workflow(dir.path(), "ok.yaml", &linear_workflow_yaml("linear"));

    let output = cli_command()
        .args(["run", path.to_str().unwrap(), "--target", "greet"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Executed: 2/3 nodes"));
}

#[test]
fn test_cli_vars_feed_templates() {
    let dir = create_test_dir();
    let path = write_workflow(
        dir.path(),
        "branch.yaml",
        r#"
name: branch
nodes:
  - id: start
    type: start
  - id: check
    type: if
    config:
      condition: "retries > 2"
  - id: give_up
    type: raise_error
    config:
      message: "too many retries"
connections:
  - { from: start.exec_out, to: check.exec_in }
  - { from: check.true, to: give_up.exec_in }
"#,
    );
    let path = path.to_str().unwrap();

    let low = cli_command()
        .args(["run", path, "--var", "retries=1"])
        .output()
        .unwrap();
    assert!(low.status.success());

    let high = cli_command()
        .args(["run", path, "--var", "retries=5"])
        .output()
        .unwrap();
    assert_eq!(high.status.code(), Some(1));
}

#[test]
fn test_cli_missing_file_exit_code() {
    let output = cli_command()
        .args(["run", "/nonexistent/workflow.yaml"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_cli_no_start_node_exit_code() {
    let dir = create_test_dir();
    let path = write_workflow(
        dir.path(),
        "headless.yaml",
        r#"
name: headless
nodes:
  - id: a
    type: log
  - id: b
    type: log
connections:
  - { from: a.exec_out, to: b.exec_in }
  - { from: b.exec_out, to: a.exec_in }
"#,
    );

    let output = cli_command()
        .args(["run", path.to_str().unwrap()])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
}

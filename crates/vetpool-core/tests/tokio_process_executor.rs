#![cfg(unix)]

use std::time::Duration;

use vetpool_core::execution::{
    CommandSpec, ProcessExitStatus, ProcessSpawnRequest, ProcessTerminationMode,
    TokioProcessExecutor, run_to_completion, spawn_validated,
};
use vetpool_core::models::{CoreErrorKind, TaskName};

fn request(task: &str, command: CommandSpec) -> ProcessSpawnRequest {
    ProcessSpawnRequest::new(TaskName::from(task), command)
}

fn sleep_request() -> ProcessSpawnRequest {
    request("sla_tile", CommandSpec::new("/bin/sleep").arg("30"))
}

#[tokio::test]
async fn spawns_echo_and_captures_stdout() {
    let executor = TokioProcessExecutor;
    let handle = spawn_validated(
        &executor,
        request("health_tile", CommandSpec::new("/bin/echo").arg("hello")),
    )
    .expect("spawn should succeed");

    assert!(handle.pid().is_some());

    let output = handle.wait().await.expect("wait should succeed");
    assert_eq!(output.status, ProcessExitStatus::ExitCode(0));
    assert_eq!(output.stdout_text().trim(), "hello");
    assert!(output.started_at <= output.finished_at);
}

#[tokio::test]
async fn captures_nonzero_exit_code_and_stderr() {
    let executor = TokioProcessExecutor;
    let output = run_to_completion(
        &executor,
        request(
            "jobs_tile",
            CommandSpec::new("/bin/sh").args(["-c", "echo 'tile missing' >&2; exit 3"]),
        ),
    )
    .await
    .expect("wait should succeed");

    assert_eq!(output.status, ProcessExitStatus::ExitCode(3));
    assert_eq!(output.stderr_text().trim(), "tile missing");
}

#[tokio::test]
async fn timeout_kills_long_running_process() {
    let executor = TokioProcessExecutor;
    let handle = spawn_validated(&executor, sleep_request().timeout(Duration::from_millis(100)))
        .expect("spawn should succeed");

    let error = handle.wait().await.expect_err("should timeout");

    assert_eq!(error.kind, CoreErrorKind::Timeout);
    assert_eq!(error.task, Some(TaskName::from("sla_tile")));
}

#[tokio::test]
async fn immediate_terminate_kills_process() {
    let executor = TokioProcessExecutor;
    let handle = spawn_validated(&executor, sleep_request()).expect("spawn should succeed");

    handle
        .terminate(ProcessTerminationMode::Immediate)
        .expect("terminate should succeed");

    let output = handle.wait().await.expect("wait should succeed");
    assert_eq!(output.status, ProcessExitStatus::Terminated);
}

#[tokio::test]
async fn graceful_terminate_sends_sigterm() {
    let executor = TokioProcessExecutor;
    let handle = spawn_validated(&executor, sleep_request()).expect("spawn should succeed");

    handle
        .terminate(ProcessTerminationMode::Graceful {
            grace_period: Duration::from_secs(5),
        })
        .expect("terminate should succeed");

    let output = handle.wait().await.expect("wait should succeed");
    assert_eq!(output.status, ProcessExitStatus::Terminated);
}

#[tokio::test]
async fn spawn_nonexistent_program_returns_process_failure() {
    let executor = TokioProcessExecutor;
    let error = match spawn_validated(
        &executor,
        request("alerts_tile", CommandSpec::new("/nonexistent/binary")),
    ) {
        Err(e) => e,
        Ok(_) => panic!("expected spawn to fail for nonexistent binary"),
    };

    assert_eq!(error.kind, CoreErrorKind::ProcessFailure);
    assert_eq!(error.task, Some(TaskName::from("alerts_tile")));
}

#[tokio::test]
async fn empty_program_is_rejected_before_spawning() {
    let executor = TokioProcessExecutor;
    let error = match spawn_validated(&executor, request("blank", CommandSpec::new(""))) {
        Err(e) => e,
        Ok(_) => panic!("expected validation to reject an empty program"),
    };

    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
}

#[tokio::test]
async fn env_vars_are_passed_to_child() {
    let executor = TokioProcessExecutor;
    let output = run_to_completion(
        &executor,
        request(
            "env_probe",
            CommandSpec::new("/usr/bin/env").env("VETPOOL_TEST_VAR", "test_value_42"),
        ),
    )
    .await
    .expect("wait should succeed");

    assert_eq!(output.status, ProcessExitStatus::ExitCode(0));
    let stdout = output.stdout_text();
    assert!(
        stdout.contains("VETPOOL_TEST_VAR=test_value_42"),
        "expected env var in output, got: {stdout}"
    );
}

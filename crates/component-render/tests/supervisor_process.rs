//! Supervisor driving real shell commands

use std::sync::Arc;
use std::time::Duration;

use component_render::{
    DevServerSupervisor, ShellProcessSpawner, StartOutcome, SupervisorConfig, SupervisorError,
};

fn supervisor(command: &str) -> DevServerSupervisor {
    DevServerSupervisor::new(
        Arc::new(ShellProcessSpawner::new()),
        SupervisorConfig {
            command: command.to_string(),
            start_timeout: Duration::from_secs(2),
            hard_ceiling: Duration::from_secs(10),
            compile_error_drain: Duration::from_millis(300),
        },
    )
}

#[tokio::test]
async fn url_line_reports_listening_port() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(
        "echo 'Starting the development server...'; echo \"  Local:  http://localhost:$PORT\"; sleep 30",
    );

    let outcome = supervisor.start_server(dir.path(), 45123).await.unwrap();

    assert_eq!(outcome.port(), Some(45123));
    let server = outcome.into_server();
    assert!(server.pid().is_some());
    server.stop();
}

#[tokio::test]
async fn nonzero_exit_is_a_crash_with_its_output() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor("echo 'SyntaxError: Unexpected token (3:10)' >&2; exit 1");

    let err = supervisor.start_server(dir.path(), 45124).await.unwrap_err();

    match err {
        SupervisorError::Crashed { exit_code, log } => {
            assert_eq!(exit_code, Some(1));
            assert!(log.contains("SyntaxError: Unexpected token"));
        }
        other => panic!("expected a crash, got {:?}", other),
    }
}

#[tokio::test]
async fn busy_port_message_is_a_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor("echo \"Something is already running on port $PORT.\"; sleep 30");

    let err = supervisor.start_server(dir.path(), 45125).await.unwrap_err();

    assert!(matches!(err, SupervisorError::PortConflict { .. }));
}

#[tokio::test]
async fn compile_failure_collects_the_error_lines() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(
        "echo 'Failed to compile.'; sleep 0.1; echo './src/components/component.jsx: Unexpected token'; sleep 30",
    );

    let err = supervisor.start_server(dir.path(), 45126).await.unwrap_err();

    assert!(matches!(err, SupervisorError::Crashed { .. }));
    assert!(err.log().contains("Failed to compile."));
    assert!(err.log().contains("component.jsx: Unexpected token"));
}

#[tokio::test]
async fn silent_server_times_out_but_keeps_running() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor("sleep 30");

    let outcome = supervisor.start_server(dir.path(), 45127).await.unwrap();

    assert!(matches!(outcome, StartOutcome::TimedOut { .. }));
    assert_eq!(outcome.port(), None);
    outcome.into_server().stop();
}

#[tokio::test]
async fn server_runs_in_the_project_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
    let supervisor = supervisor("cat marker.txt; echo \"Local: http://localhost:$PORT\"; sleep 30");

    let outcome = supervisor.start_server(dir.path(), 45128).await.unwrap();

    assert_eq!(outcome.port(), Some(45128));
}

#[tokio::test]
async fn non_utf8_output_before_url_still_reports_listening() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(
        "printf 'warn: caf\\xe9\\n'; echo \"  Local:  http://localhost:$PORT\"; sleep 30",
    );

    let outcome = supervisor.start_server(dir.path(), 45129).await.unwrap();

    assert_eq!(outcome.port(), Some(45129));
    outcome.into_server().stop();
}

#[tokio::test]
async fn non_utf8_crash_output_reaches_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor =
        supervisor("printf 'bad byte \\xff\\n' >&2; echo 'Error: Cannot find module' >&2; exit 1");

    let err = supervisor.start_server(dir.path(), 45130).await.unwrap_err();

    match err {
        SupervisorError::Crashed { exit_code, log } => {
            assert_eq!(exit_code, Some(1));
            assert!(log.contains("bad byte"));
            assert!(log.contains("Error: Cannot find module"));
        }
        other => panic!("expected a crash, got {:?}", other),
    }
}

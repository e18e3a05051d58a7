//! End-to-end integration tests for ptymux.
//!
//! These tests verify complete flows over the daemon socket:
//! - Daemon startup and shutdown
//! - Session creation, attachment and input
//! - Fan-out to several clients
//! - Cleanup of sessions whose process exited

use std::time::Duration;

use ptymux_daemon::config::Config;
use ptymux_daemon::ipc::{IpcClient, IpcError, IpcResponse};
use ptymux_daemon::orchestrator::{DaemonOrchestrator, OrchestratorState};
use ptymux_daemon::protocol::{ErrorCode, SessionCreate, SessionStatus, TerminalMessage};
use tempfile::TempDir;

/// Upper bound for anything a test waits on.
const WAIT: Duration = Duration::from_secs(10);

/// Create a test configuration with a temporary directory.
fn create_test_config() -> (Config, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.daemon.data_dir = temp_dir.path().join("data");
    config.ipc.socket_path = Some(temp_dir.path().join("run").join("daemon.sock"));
    config.session.default_shell = "/bin/sh".to_string();
    config.session.terminate_grace_ms = 300;
    (config, temp_dir)
}

async fn start_daemon() -> (DaemonOrchestrator, TempDir) {
    let (config, temp_dir) = create_test_config();
    let orchestrator = DaemonOrchestrator::new(config).unwrap();
    orchestrator.start().await.unwrap();
    (orchestrator, temp_dir)
}

async fn connect(orchestrator: &DaemonOrchestrator) -> IpcClient {
    IpcClient::connect(orchestrator.socket_path()).await.unwrap()
}

fn command(program: &str, args: &[&str]) -> SessionCreate {
    SessionCreate {
        command: Some(program.to_string()),
        args: args.iter().map(|a| a.to_string()).collect(),
        ..SessionCreate::default()
    }
}

/// Reads output chunks until their concatenation contains `needle`
/// `occurrences` times. Returns the chunks in arrival order.
async fn read_output_until(client: &mut IpcClient, needle: &str, occurrences: usize) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut seen = String::new();

    tokio::time::timeout(WAIT, async {
        while seen.matches(needle).count() < occurrences {
            match client.next_event().await.unwrap() {
                Some(TerminalMessage::Output { data, .. }) => {
                    seen.push_str(&String::from_utf8_lossy(&data));
                    chunks.push(data);
                }
                Some(_) => {}
                None => panic!("daemon closed the connection"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}, saw {:?}", needle, seen));

    chunks
}

// =============================================================================
// Daemon Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_daemon_starts_and_answers_ping() {
    let (orchestrator, _temp_dir) = start_daemon().await;
    assert_eq!(orchestrator.state().await, OrchestratorState::Running);

    let mut client = connect(&orchestrator).await;
    assert!(client.ping().await.unwrap());

    match client.status().await.unwrap() {
        IpcResponse::Status {
            running,
            pid,
            session_count,
            ..
        } => {
            assert!(running);
            assert_eq!(pid, std::process::id());
            assert_eq!(session_count, 0);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_request_terminates_sessions() {
    let (orchestrator, _temp_dir) = start_daemon().await;
    let mut client = connect(&orchestrator).await;

    client.create_session(command("sleep", &["30"])).await.unwrap();
    assert_eq!(orchestrator.registry().len(), 1);

    assert!(matches!(
        client.stop().await.unwrap(),
        IpcResponse::Stopping
    ));
    tokio::time::timeout(WAIT, orchestrator.shutdown_token().cancelled())
        .await
        .unwrap();

    orchestrator.stop().await.unwrap();
    assert!(orchestrator.registry().is_empty());
    assert!(!orchestrator.socket_path().exists());
}

// =============================================================================
// Session Flow Tests
// =============================================================================

#[tokio::test]
async fn test_input_is_echoed_to_subscriber() {
    let (orchestrator, _temp_dir) = start_daemon().await;
    let mut client = connect(&orchestrator).await;

    let created = client.create_session(command("cat", &[])).await.unwrap();
    assert!(created.pid.is_some());

    client.attach(&created.session_id).await.unwrap();
    client
        .send_input(&created.session_id, b"ping\n")
        .await
        .unwrap();

    let chunks = read_output_until(&mut client, "ping", 1).await;
    assert!(!chunks.is_empty());

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_two_subscribers_receive_identical_output() {
    let (orchestrator, _temp_dir) = start_daemon().await;
    let mut first = connect(&orchestrator).await;
    let mut second = connect(&orchestrator).await;

    let created = first.create_session(command("cat", &[])).await.unwrap();
    first.attach(&created.session_id).await.unwrap();
    second.attach(&created.session_id).await.unwrap();

    first
        .send_input(&created.session_id, b"ping\n")
        .await
        .unwrap();

    // The terminal echoes the line and cat repeats it.
    let first_chunks = read_output_until(&mut first, "ping", 2).await;
    let second_chunks = read_output_until(&mut second, "ping", 2).await;
    assert_eq!(first_chunks, second_chunks);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_exited_session_is_removed_and_refuses_input() {
    let (orchestrator, _temp_dir) = start_daemon().await;
    let mut client = connect(&orchestrator).await;

    let created = client
        .create_session(command("sh", &["-c", "exit 1"]))
        .await
        .unwrap();

    tokio::time::timeout(WAIT, async {
        loop {
            let sessions = client.list_sessions().await.unwrap();
            if sessions.iter().all(|s| s.id != created.session_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    let err = client
        .send_input(&created.session_id, b"late\n")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IpcError::Remote {
            code: ErrorCode::NotFound,
            ..
        }
    ));

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_attached_client_sees_exit_code() {
    let (orchestrator, _temp_dir) = start_daemon().await;
    let mut client = connect(&orchestrator).await;

    let created = client
        .create_session(command("sh", &["-c", "read line; exit 3"]))
        .await
        .unwrap();
    client.attach(&created.session_id).await.unwrap();
    client
        .send_input(&created.session_id, b"go\n")
        .await
        .unwrap();

    let exit_code = tokio::time::timeout(WAIT, async {
        loop {
            match client.next_event().await.unwrap() {
                Some(TerminalMessage::Status {
                    status: SessionStatus::Closed,
                    exit_code,
                    ..
                }) => break exit_code,
                Some(_) => {}
                None => panic!("daemon closed the connection"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(exit_code, Some(3));

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_detached_client_receives_no_further_output() {
    let (orchestrator, _temp_dir) = start_daemon().await;
    let mut watcher = connect(&orchestrator).await;
    let mut typist = connect(&orchestrator).await;

    let created = typist.create_session(command("cat", &[])).await.unwrap();
    watcher.attach(&created.session_id).await.unwrap();
    typist.attach(&created.session_id).await.unwrap();

    watcher.detach(&created.session_id).await.unwrap();
    typist
        .send_input(&created.session_id, b"ping\n")
        .await
        .unwrap();
    read_output_until(&mut typist, "ping", 2).await;

    // Only the status sent on attach may still be queued for the watcher.
    let mut late_output = Vec::new();
    let _ = tokio::time::timeout(Duration::from_millis(500), async {
        while let Ok(Some(message)) = watcher.next_event().await {
            if let TerminalMessage::Output { data, .. } = message {
                late_output.push(data);
            }
        }
    })
    .await;
    assert!(late_output.is_empty(), "detached client received {:?}", late_output);

    // The session keeps running for the remaining subscriber.
    let sessions = typist.list_sessions().await.unwrap();
    let summary = sessions
        .iter()
        .find(|s| s.id == created.session_id)
        .unwrap();
    assert_eq!(summary.subscribers, 1);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_session_survives_client_disconnect() {
    let (orchestrator, _temp_dir) = start_daemon().await;

    let session_id = {
        let mut client = connect(&orchestrator).await;
        let created = client.create_session(command("cat", &[])).await.unwrap();
        client.attach(&created.session_id).await.unwrap();
        created.session_id
    };

    let mut client = connect(&orchestrator).await;
    client.attach(&session_id).await.unwrap();
    client.send_input(&session_id, b"again\n").await.unwrap();
    read_output_until(&mut client, "again", 1).await;

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_kill_session_closes_it() {
    let (orchestrator, _temp_dir) = start_daemon().await;
    let mut client = connect(&orchestrator).await;

    let created = client.create_session(command("sleep", &["30"])).await.unwrap();
    let response = client
        .kill_session(&created.session_id, Some(15))
        .await
        .unwrap();
    assert!(matches!(response, IpcResponse::SessionKilled { .. }));

    tokio::time::timeout(WAIT, async {
        while orchestrator.registry().get(&created.session_id).is_ok() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    // Killing again reports the session as gone.
    match client.kill_session(&created.session_id, None).await.unwrap() {
        IpcResponse::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
        other => panic!("unexpected response: {:?}", other),
    }

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_program_reports_spawn_failure() {
    let (orchestrator, _temp_dir) = start_daemon().await;
    let mut client = connect(&orchestrator).await;

    let err = client
        .create_session(command("/nonexistent/ptymux-test-binary", &[]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IpcError::Remote {
            code: ErrorCode::SpawnFailed,
            ..
        }
    ));
    assert!(client.list_sessions().await.unwrap().is_empty());

    orchestrator.stop().await.unwrap();
}

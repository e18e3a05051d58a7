//! IPC message types for CLI-daemon communication.
//!
//! This module defines the request and response types used for communication
//! between the CLI and the daemon over Unix Domain Sockets.

use ptymux_protocol::{ErrorCode, SessionCreate, SessionCreated, TerminalMessage};
use serde::{Deserialize, Serialize};

use crate::session::SessionSummary;

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List all sessions that are not closed.
    ListSessions,
    /// Start a new session.
    CreateSession(SessionCreate),
    /// Subscribe this connection to a session's output.
    AttachSession {
        /// The session to attach to.
        session_id: String,
    },
    /// Stop receiving a session's output. The session keeps running.
    DetachSession {
        /// The session to detach from.
        session_id: String,
    },
    /// Forward input bytes. Must be an `input` envelope.
    Input(TerminalMessage),
    /// Change a session's terminal size.
    ResizeSession {
        /// The session to resize.
        session_id: String,
        /// New column count.
        cols: u16,
        /// New row count.
        rows: u16,
    },
    /// Terminate a session.
    KillSession {
        /// The unique identifier of the session to kill.
        session_id: String,
        /// Signal to send (default: SIGHUP/1, escalating to SIGKILL).
        /// Common values: 1 (SIGHUP), 9 (SIGKILL), 15 (SIGTERM).
        signal: Option<i32>,
    },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Daemon process ID.
        pid: u32,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of sessions that are not closed.
        session_count: usize,
        /// Number of subscribers across all sessions.
        subscriber_count: usize,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// List of sessions.
    Sessions {
        /// Snapshot of each session.
        sessions: Vec<SessionSummary>,
    },
    /// A session was created.
    SessionCreated(SessionCreated),
    /// This connection now receives the session's output.
    Attached {
        /// The attached session.
        session_id: String,
        /// Identifier of the subscriber backing this attachment.
        subscriber_id: String,
    },
    /// This connection no longer receives the session's output.
    Detached {
        /// The detached session.
        session_id: String,
    },
    /// The request was applied.
    Ack,
    /// Confirmation that termination was requested.
    SessionKilled {
        /// The ID of the session being terminated.
        session_id: String,
    },
    /// Streamed output or status of an attached session.
    Terminal(TerminalMessage),
    /// An error occurred processing the request.
    Error {
        /// Machine-readable error category.
        code: ErrorCode,
        /// Human-readable error message.
        message: String,
    },
}

impl IpcResponse {
    /// Builds an error response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        IpcResponse::Error {
            code,
            message: message.into(),
        }
    }

    /// Returns true for responses pushed without a matching request.
    pub fn is_streamed(&self) -> bool {
        matches!(self, IpcResponse::Terminal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    #[test]
    fn test_request_unit_variants_serialization() {
        for (request, expected) in [
            (IpcRequest::Ping, r#""Ping""#),
            (IpcRequest::Status, r#""Status""#),
            (IpcRequest::Stop, r#""Stop""#),
            (IpcRequest::ListSessions, r#""ListSessions""#),
        ] {
            let json = serde_json::to_string(&request).unwrap();
            assert_eq!(json, expected);
            let deserialized: IpcRequest = serde_json::from_str(&json).unwrap();
            assert_eq!(deserialized, request);
        }
    }

    #[test]
    fn test_request_create_session_defaults() {
        let json = r#"{"CreateSession":{"command":"htop"}}"#;
        let request: IpcRequest = serde_json::from_str(json).unwrap();
        match request {
            IpcRequest::CreateSession(create) => {
                assert_eq!(create.command.as_deref(), Some("htop"));
                assert!(create.args.is_empty());
                assert_eq!((create.cols, create.rows), (80, 24));
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_request_input_carries_envelope() {
        let request = IpcRequest::Input(TerminalMessage::input("s1", b"ls\r".to_vec()));
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&request).unwrap()).unwrap();

        assert_eq!(value["Input"]["type"], "input");
        assert_eq!(value["Input"]["session_id"], "s1");
        assert_eq!(value["Input"]["data"], "bHMN");
    }

    #[test]
    fn test_request_kill_session_with_signal_serialization() {
        let request = IpcRequest::KillSession {
            session_id: "test-session-456".to_string(),
            signal: Some(9),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("KillSession"));
        assert!(json.contains("test-session-456"));

        let deserialized: IpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, request);
    }

    #[test]
    fn test_response_sessions_serialization() {
        let response = IpcResponse::Sessions {
            sessions: vec![SessionSummary {
                id: "abc".to_string(),
                state: SessionState::Active,
                pid: Some(1234),
                command: "bash -l".to_string(),
                cwd: None,
                created_at: 1,
                last_activity_at: 2,
                subscribers: 1,
                exit_code: None,
            }],
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""state":"active""#));

        let deserialized: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, response);
    }

    #[test]
    fn test_response_error_serialization() {
        let response = IpcResponse::error(ErrorCode::NotFound, "session not found: x");
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""code":"not_found""#));

        let deserialized: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, response);
    }

    #[test]
    fn test_is_streamed() {
        assert!(IpcResponse::Terminal(TerminalMessage::output("s", vec![1])).is_streamed());
        assert!(!IpcResponse::Ack.is_streamed());
        assert!(!IpcResponse::Pong.is_streamed());
    }
}

//! Protocol message definitions for ptymux.
//!
//! This module defines the terminal envelope exchanged between the daemon and
//! its clients, plus the launch parameters and error codes used by the control
//! requests. All messages are serialized as JSON; byte payloads travel as
//! base64 strings so that arbitrary terminal output survives the trip.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Lifecycle status reported to clients in `status` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// The process is being spawned.
    Starting,
    /// The process is running and accepting input.
    Active,
    /// Termination was requested or the process exited; input is refused.
    Closing,
    /// All resources were released. Terminal state.
    Closed,
    /// Output was dropped for this subscriber because it fell behind.
    DataDropped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Active => "active",
            SessionStatus::Closing => "closing",
            SessionStatus::Closed => "closed",
            SessionStatus::DataDropped => "data_dropped",
        };
        f.write_str(s)
    }
}

/// Terminal envelope carrying input, output or a status change.
///
/// Serialized as an internally tagged JSON object:
///
/// ```json
/// {"type":"output","session_id":"…","data":"aGVsbG8=","timestamp":1700000000000}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalMessage {
    /// Bytes typed by a client, destined for the process.
    Input {
        /// Target session.
        session_id: String,
        /// Raw input bytes.
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        /// Unix milliseconds when the message was created.
        timestamp: u64,
    },
    /// Bytes produced by the process.
    Output {
        /// Source session.
        session_id: String,
        /// Raw output bytes.
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        /// Unix milliseconds when the chunk was read.
        timestamp: u64,
    },
    /// Lifecycle or delivery notification.
    Status {
        /// Session the status applies to.
        session_id: String,
        /// New status.
        status: SessionStatus,
        /// Exit code, present once the process has exited.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        /// Number of chunks dropped, present for `data_dropped`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dropped: Option<u64>,
        /// Unix milliseconds when the status was emitted.
        timestamp: u64,
    },
}

impl TerminalMessage {
    /// Builds an input envelope stamped with the current time.
    pub fn input(session_id: impl Into<String>, data: Vec<u8>) -> Self {
        TerminalMessage::Input {
            session_id: session_id.into(),
            data,
            timestamp: now_millis(),
        }
    }

    /// Builds an output envelope stamped with the current time.
    pub fn output(session_id: impl Into<String>, data: Vec<u8>) -> Self {
        TerminalMessage::Output {
            session_id: session_id.into(),
            data,
            timestamp: now_millis(),
        }
    }

    /// Builds a status envelope with no exit code or drop count.
    pub fn status(session_id: impl Into<String>, status: SessionStatus) -> Self {
        TerminalMessage::Status {
            session_id: session_id.into(),
            status,
            exit_code: None,
            dropped: None,
            timestamp: now_millis(),
        }
    }

    /// Builds a `closed` status envelope carrying the exit code.
    pub fn closed(session_id: impl Into<String>, exit_code: Option<i32>) -> Self {
        TerminalMessage::Status {
            session_id: session_id.into(),
            status: SessionStatus::Closed,
            exit_code,
            dropped: None,
            timestamp: now_millis(),
        }
    }

    /// Builds a `data_dropped` status envelope.
    pub fn data_dropped(session_id: impl Into<String>, dropped: u64) -> Self {
        TerminalMessage::Status {
            session_id: session_id.into(),
            status: SessionStatus::DataDropped,
            exit_code: None,
            dropped: Some(dropped),
            timestamp: now_millis(),
        }
    }

    /// Returns the session the message belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            TerminalMessage::Input { session_id, .. }
            | TerminalMessage::Output { session_id, .. }
            | TerminalMessage::Status { session_id, .. } => session_id,
        }
    }

    /// Returns the message timestamp in Unix milliseconds.
    pub fn timestamp(&self) -> u64 {
        match self {
            TerminalMessage::Input { timestamp, .. }
            | TerminalMessage::Output { timestamp, .. }
            | TerminalMessage::Status { timestamp, .. } => *timestamp,
        }
    }

    /// Returns the byte payload for input and output messages.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            TerminalMessage::Input { data, .. } | TerminalMessage::Output { data, .. } => {
                Some(data)
            }
            TerminalMessage::Status { .. } => None,
        }
    }

    /// Serializes the message to a single-line JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a message from JSON and checks envelope rules.
    pub fn from_json(s: &str) -> Result<Self> {
        let msg: TerminalMessage = serde_json::from_str(s)?;
        if msg.session_id().is_empty() {
            return Err(ProtocolError::InvalidMessage(
                "session_id must not be empty".to_string(),
            ));
        }
        Ok(msg)
    }
}

/// Parameters for launching a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionCreate {
    /// Program to run. `None` runs the daemon's default shell.
    pub command: Option<String>,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory for the process.
    pub cwd: Option<String>,
    /// Environment variables added to the inherited environment.
    pub env: Vec<(String, String)>,
    /// Initial terminal columns.
    pub cols: u16,
    /// Initial terminal rows.
    pub rows: u16,
}

impl Default for SessionCreate {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            cols: 80,
            rows: 24,
        }
    }
}

/// Response confirming session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
    /// Unique session identifier.
    pub session_id: String,
    /// Process ID of the spawned program.
    pub pid: Option<u32>,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown or unspecified error.
    Unknown,
    /// Session not found.
    NotFound,
    /// Invalid request or parameters.
    InvalidRequest,
    /// Server-side error.
    InternalError,
    /// The process could not be started.
    SpawnFailed,
    /// The session no longer accepts the operation.
    SessionTerminated,
    /// Input arrived after the process channel closed.
    WriteAfterClose,
    /// The session limit is reached.
    LimitReached,
    /// The process is not consuming input fast enough.
    Backpressure,
}

/// Serde adapter encoding byte vectors as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

//! # ptymux Protocol Library
//!
//! Wire types shared by the ptymux daemon and the clients that talk to it.
//!
//! ## Overview
//!
//! The session core in the daemon is transport-agnostic: it deals in raw byte
//! chunks and lifecycle events. This crate defines how those chunks and events
//! look once they leave the daemon:
//!
//! - **Terminal envelope**: [`TerminalMessage`], the `{type, session_id, data,
//!   timestamp}` JSON object carrying input, output and status updates
//! - **Launch parameters**: [`SessionCreate`] describing the command to run
//! - **Error codes**: [`ErrorCode`], the stable classification of failures
//!
//! ## Example Usage
//!
//! ```rust
//! use ptymux_protocol::{SessionStatus, TerminalMessage};
//!
//! let msg = TerminalMessage::output("sess-1", b"hello\r\n".to_vec());
//! let json = msg.to_json().unwrap();
//! assert!(json.contains("\"type\":\"output\""));
//!
//! let parsed = TerminalMessage::from_json(&json).unwrap();
//! assert_eq!(parsed.data(), Some(&b"hello\r\n"[..]));
//!
//! let closed = TerminalMessage::status("sess-1", SessionStatus::Closed);
//! assert_eq!(closed.session_id(), "sess-1");
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Terminal envelope, launch parameters and error codes
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    now_millis, ErrorCode, SessionCreate, SessionCreated, SessionStatus, TerminalMessage,
    PROTOCOL_VERSION,
};

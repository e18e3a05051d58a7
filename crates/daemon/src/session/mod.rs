//! Session management module.
//!
//! This module provides PTY-backed process channels, the session lifecycle
//! with output fan-out to subscribers, and the registry of live sessions.

pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod multiplexer;
pub mod pty;

/// Unique identifier of a session.
pub type SessionId = String;

pub use error::SessionError;
pub use lifecycle::{Session, SessionEvent, SessionSettings, SessionState, SessionSummary};
pub use manager::{SessionControl, SessionRegistry};
pub use multiplexer::{SubscriberEvent, SubscriberId, SubscriberStats, SubscriberStream};
pub use pty::{LaunchSpec, ProcessChannel};

//! # ptymux Daemon Library
//!
//! This crate provides the terminal session multiplexer behind the `ptymux`
//! command: programs run in pseudo-terminals, any number of clients watch
//! their output, and sessions outlive the clients that started them.
//!
//! ## Overview
//!
//! - **Process channels**: spawn a program on a PTY and move bytes in and out
//! - **Sessions**: a `starting → active → closing → closed` lifecycle with
//!   output fan-out to subscribers and input routed back to the process
//! - **Back-pressure**: every subscriber has a bounded queue; a slow one loses
//!   chunks and is told so, without stalling the others
//! - **Registry**: create, look up, list and reap sessions; closed sessions
//!   remove themselves
//! - **IPC**: a Unix socket speaking newline-delimited JSON for the CLI
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────────────────┐    ┌──────────────────────────┐  │
//! │  │   IPC Server       │───▶│  Connection Handler      │  │
//! │  └────────────────────┘    └────────────┬─────────────┘  │
//! │                                         │ SessionControl  │
//! │  ┌──────────────────────────────────────▼──────────────┐ │
//! │  │                Session Registry                      │ │
//! │  │   Session ──▶ pump ──▶ subscriber queues             │ │
//! │  │      │                                               │ │
//! │  │   ProcessChannel (PTY, reader/writer/waiter threads) │ │
//! │  └──────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ptymux_daemon::session::{LaunchSpec, SessionRegistry, SubscriberEvent};
//! use ptymux_daemon::config::SessionConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = SessionRegistry::new(SessionConfig::default());
//!     let session = registry.create(LaunchSpec::new("echo").arg("hello")).await?;
//!
//!     let mut stream = session.attach().await?;
//!     while let Some(event) = stream.recv().await {
//!         if let SubscriberEvent::Output(chunk) = event {
//!             print!("{}", String::from_utf8_lossy(&chunk));
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`logging`]: Tracing subscriber setup
//! - [`session`]: Process channels, sessions and the registry
//! - [`ipc`]: Local socket transport and CLI client
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod ipc;
pub mod logging;
pub mod orchestrator;
pub mod session;

// Re-export protocol for convenience
pub use ptymux_protocol as protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{
    LaunchSpec, Session, SessionControl, SessionError, SessionId, SessionRegistry, SessionState,
    SessionSummary,
};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};

//! Unix Domain Socket IPC module for CLI-daemon communication.
//!
//! This module is the local transport adapter over the session core. It
//! exposes create, attach, detach, input, resize, kill and listing to the
//! `ptymux` CLI.
//!
//! ## Overview
//!
//! The IPC system uses a JSON newline-delimited protocol. Each message is a
//! single JSON object followed by a newline. A connection that attaches to a
//! session additionally receives [`IpcResponse::Terminal`] messages carrying
//! output and status envelopes while it keeps sending requests.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/ptymux/daemon.sock`
//! - Fallback: `/tmp/ptymux-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use ptymux_daemon::ipc::{IpcClient, get_socket_path};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket_path = get_socket_path();
//!     let mut client = IpcClient::connect(&socket_path).await?;
//!
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod handler;
mod messages;
pub mod pidfile;
mod server;

pub use client::{IpcClient, IpcEventReader, IpcRequestWriter};
pub use handler::{ConnectionHandler, DaemonStatus};
pub use messages::{IpcRequest, IpcResponse};
pub use pidfile::{get_daemon_pid, get_pid_file_path, is_daemon_running, pid_file_in};
pub use server::{IpcConnection, IpcError, IpcServer, RequestReader, ResponseWriter};

use std::path::PathBuf;

/// Get the socket path for IPC communication.
///
/// ## Path Resolution
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/ptymux/daemon.sock`
/// 2. Otherwise: `/tmp/ptymux-$UID/daemon.sock`
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => {
            PathBuf::from(runtime_dir).join("ptymux").join("daemon.sock")
        }
        _ => {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/ptymux-{}", uid)).join("daemon.sock")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn with_runtime_dir<T>(value: Option<&str>, f: impl FnOnce() -> T) -> T {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();
        match value {
            Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
            None => std::env::remove_var("XDG_RUNTIME_DIR"),
        }
        let result = f();
        match original {
            Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
            None => std::env::remove_var("XDG_RUNTIME_DIR"),
        }
        result
    }

    #[test]
    #[serial]
    fn test_get_socket_path_with_xdg_runtime_dir() {
        let path = with_runtime_dir(Some("/run/user/1000"), get_socket_path);
        assert_eq!(path, PathBuf::from("/run/user/1000/ptymux/daemon.sock"));
    }

    #[test]
    #[serial]
    fn test_get_socket_path_without_xdg_runtime_dir() {
        let path = with_runtime_dir(None, get_socket_path);
        let path = path.to_string_lossy();
        assert!(path.starts_with("/tmp/ptymux-"));
        assert!(path.ends_with("/daemon.sock"));
    }

    #[test]
    #[serial]
    fn test_socket_path_is_absolute() {
        let path = get_socket_path();
        assert!(path.is_absolute());
        assert!(path.extension().map(|e| e == "sock").unwrap_or(false));
    }
}

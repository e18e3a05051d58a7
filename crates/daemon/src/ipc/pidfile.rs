//! PID file utilities for daemon running detection.
//!
//! The daemon writes its PID into `<data_dir>/daemon.pid` on start and
//! removes it on shutdown. The CLI reads it to tell a running daemon from a
//! stale file left behind by a crash.
//!
//! ## PID File Location
//!
//! - `$XDG_DATA_HOME/ptymux/daemon.pid` if XDG_DATA_HOME is set
//! - `~/.local/share/ptymux/daemon.pid` otherwise
//!
//! ## Example
//!
//! ```rust
//! use ptymux_daemon::ipc::pidfile::{is_daemon_running, get_daemon_pid};
//!
//! if is_daemon_running() {
//!     if let Some(pid) = get_daemon_pid() {
//!         println!("Daemon is already running with PID {}", pid);
//!     }
//! }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;

/// File name of the PID file inside the data directory.
const PID_FILE_NAME: &str = "daemon.pid";

/// Get the default path to the daemon PID file.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    pid_file_in(&data_dir.join("ptymux"))
}

/// Returns the PID file path inside a data directory.
pub fn pid_file_in(data_dir: &Path) -> PathBuf {
    data_dir.join(PID_FILE_NAME)
}

/// Check if a daemon process is currently running.
///
/// Cleans up stale PID files automatically.
pub fn is_daemon_running() -> bool {
    get_daemon_pid().is_some()
}

/// Get the PID of the running daemon, if any.
///
/// Returns `Some(pid)` if daemon is running, `None` otherwise.
pub fn get_daemon_pid() -> Option<u32> {
    read_daemon_pid(&get_pid_file_path())
}

/// Reads a PID file and returns the PID if that process is alive.
///
/// Invalid or stale files are removed.
pub fn read_daemon_pid(path: &Path) -> Option<u32> {
    let pid_str = fs::read_to_string(path).ok()?;

    let pid: u32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => {
            cleanup_stale_pid_file(path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Writes the current process ID, creating parent directories.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Removes the PID file if it still names the current process.
pub fn remove_pid_file(path: &Path) {
    let ours = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .is_some_and(|pid| pid == std::process::id());
    if ours {
        cleanup_stale_pid_file(path);
    }
}

/// Check if a process with the given PID exists.
fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // Signal 0 only checks for existence. EPERM still means it exists.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_pid_file_path_structure() {
        let path = get_pid_file_path();
        assert!(path.ends_with("ptymux/daemon.pid"));
    }

    #[test]
    fn test_is_process_running_current() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn test_is_process_running_invalid() {
        assert!(!is_process_running(4_000_000_000));
        assert!(!is_process_running(0));
    }

    #[test]
    fn test_write_read_remove() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = pid_file_in(&temp_dir.path().join("nested"));

        write_pid_file(&path).unwrap();
        assert_eq!(read_daemon_pid(&path), Some(std::process::id()));

        remove_pid_file(&path);
        assert!(!path.exists());
        assert_eq!(read_daemon_pid(&path), None);
    }

    #[test]
    fn test_stale_pid_file_is_cleaned_up() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = pid_file_in(temp_dir.path());
        fs::write(&path, "4000000000\n").unwrap();

        assert_eq!(read_daemon_pid(&path), None);
        assert!(!path.exists(), "Stale PID file should be cleaned up");
    }

    #[test]
    fn test_garbage_pid_file_is_cleaned_up() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = pid_file_in(temp_dir.path());
        fs::write(&path, "not a pid").unwrap();

        assert_eq!(read_daemon_pid(&path), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_leaves_foreign_pid_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = pid_file_in(temp_dir.path());
        fs::write(&path, "1\n").unwrap();

        remove_pid_file(&path);
        assert!(path.exists());
    }
}

//! PTY-backed process channel.
//!
//! A [`ProcessChannel`] owns exactly one child process attached to a
//! pseudo-terminal. Output is read on a dedicated blocking thread and handed
//! to async callers through a bounded channel, input is written on a second
//! thread, and a third thread waits for the process to exit. Callers never
//! block a runtime worker on PTY I/O.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, watch, Mutex};

use super::error::SessionError;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Chunks buffered between the reader thread and the pump.
const OUTPUT_QUEUE_CAPACITY: usize = 64;

/// Exit code reported when the exit status could not be collected.
const UNKNOWN_EXIT_CODE: i32 = -1;

/// Immutable launch parameters for a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Program to execute, resolved through `PATH` when it has no slash.
    pub program: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Working directory. Defaults to the daemon's working directory.
    pub cwd: Option<PathBuf>,
    /// Environment variables added to the inherited environment.
    pub env: Vec<(String, String)>,
    /// Initial terminal columns.
    pub cols: u16,
    /// Initial terminal rows.
    pub rows: u16,
}

impl LaunchSpec {
    /// Creates a launch spec for `program` with an 80x24 terminal.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            cols: 80,
            rows: 24,
        }
    }

    /// Appends a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the initial terminal size.
    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    /// Returns true if the environment overrides contain `key`.
    pub fn has_env(&self, key: &str) -> bool {
        self.env.iter().any(|(k, _)| k == key)
    }

    /// Returns the program followed by its arguments, space separated.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Resolves the program to an executable path, checking the working
    /// directory first.
    fn resolve(&self) -> Result<(PathBuf, PathBuf), SessionError> {
        let cwd = match &self.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        if !cwd.is_dir() {
            return Err(SessionError::Spawn(format!(
                "working directory does not exist: {}",
                cwd.display()
            )));
        }

        let path_var = self
            .env
            .iter()
            .rev()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.clone().into())
            .or_else(|| std::env::var_os("PATH"));

        let program = which::which_in(&self.program, path_var, &cwd).map_err(|e| {
            if Path::new(&self.program).exists() {
                SessionError::Spawn(format!("{}: permission denied", self.program))
            } else {
                SessionError::Spawn(format!("{}: {}", self.program, e))
            }
        })?;

        Ok((program, cwd))
    }
}

/// A child process attached to a pseudo-terminal.
///
/// Created by [`ProcessChannel::start`] and never reused. The channel is the
/// only owner of the PTY master; [`ProcessChannel::release`] drops it.
pub struct ProcessChannel {
    /// Process ID of the child, if the platform reported one.
    pid: Option<u32>,
    /// PTY master, kept for resizing. `None` after release.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    /// Queue drained by the writer thread. `None` after release.
    input_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// Chunks produced by the reader thread.
    output_rx: Mutex<mpsc::Receiver<Bytes>>,
    /// Exit code published by the waiter thread.
    exit_rx: watch::Receiver<Option<i32>>,
    /// Fallback killer used when no PID is known.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Set once the channel was released.
    released: AtomicBool,
}

impl ProcessChannel {
    /// Spawns the process described by `launch` on a fresh PTY.
    ///
    /// `input_capacity` bounds the number of pending input chunks.
    ///
    /// # Errors
    /// Returns [`SessionError::Spawn`] if the working directory is invalid,
    /// the program cannot be found or executed, or the PTY cannot be opened.
    pub fn start(launch: &LaunchSpec, input_capacity: usize) -> Result<Self, SessionError> {
        let (program, cwd) = launch.resolve()?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: launch.rows,
                cols: launch.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&launch.args);
        cmd.cwd(&cwd);
        for (key, value) in &launch.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn(format!("{}: {}", launch.program, e)))?;

        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(input_capacity.max(1));
        let (exit_tx, exit_rx) = watch::channel(None);

        let label = pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());

        std::thread::Builder::new()
            .name(format!("pty-reader-{}", label))
            .spawn(move || read_loop(reader, output_tx))?;

        std::thread::Builder::new()
            .name(format!("pty-writer-{}", label))
            .spawn(move || write_loop(writer, input_rx))?;

        std::thread::Builder::new()
            .name(format!("pty-wait-{}", label))
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to collect exit status");
                        UNKNOWN_EXIT_CODE
                    }
                };
                let _ = exit_tx.send(Some(code));
            })?;

        tracing::debug!(
            pid = ?pid,
            program = %program.display(),
            cwd = %cwd.display(),
            "Spawned process on PTY"
        );

        Ok(Self {
            pid,
            master: Mutex::new(Some(pair.master)),
            input_tx: Mutex::new(Some(input_tx)),
            output_rx: Mutex::new(output_rx),
            exit_rx,
            killer: Mutex::new(killer),
            released: AtomicBool::new(false),
        })
    }

    /// Returns the process ID of the child, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether the process is still running.
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Returns the exit code once the process has exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Awaits the next output chunk.
    ///
    /// Returns `None` once the process output is drained (end of stream).
    pub async fn read_chunk(&self) -> Option<Bytes> {
        self.output_rx.lock().await.recv().await
    }

    /// Queues `data` for the process input.
    ///
    /// # Errors
    /// [`SessionError::WriteAfterClose`] once the process exited or the
    /// channel was released, [`SessionError::InputBackpressure`] if the input
    /// queue is full.
    pub async fn write_chunk(&self, data: Bytes) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::WriteAfterClose);
        }

        let guard = self.input_tx.lock().await;
        let tx = guard.as_ref().ok_or(SessionError::WriteAfterClose)?;
        tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::InputBackpressure,
            mpsc::error::TrySendError::Closed(_) => SessionError::WriteAfterClose,
        })
    }

    /// Sends `signal` to the process group of the child.
    ///
    /// Idempotent: signalling an exited process is a no-op.
    pub async fn terminate(&self, signal: Signal) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Ok(());
        }

        match self.pid {
            Some(pid) => signal_process_group(pid, signal),
            None => {
                let mut killer = self.killer.lock().await;
                match killer.kill() {
                    Ok(()) => Ok(()),
                    Err(e) if !self.is_alive() => {
                        tracing::debug!(error = %e, "Kill raced with process exit");
                        Ok(())
                    }
                    Err(e) => Err(SessionError::Signal(e.to_string())),
                }
            }
        }
    }

    /// Resolves with the exit code once the process has exited.
    pub async fn wait_exit(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        let code = match rx.wait_for(Option::is_some).await {
            Ok(code) => (*code).unwrap_or(UNKNOWN_EXIT_CODE),
            Err(_) => UNKNOWN_EXIT_CODE,
        };
        code
    }

    /// Resizes the PTY window.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let master = self.master.lock().await;
        let master = master
            .as_ref()
            .ok_or_else(|| SessionError::Resize("PTY already released".to_string()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Resize(e.to_string()))
    }

    /// Drops the input queue and the PTY master.
    ///
    /// Safe to call more than once.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.input_tx.lock().await.take();
        self.master.lock().await.take();
        tracing::trace!(pid = ?self.pid, "Released PTY");
    }

    /// Returns whether [`ProcessChannel::release`] has been called.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Reads the PTY until EOF or error, forwarding chunks to `tx`.
fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Bytes>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the slave side is closed.
            Err(e) => {
                tracing::trace!(error = %e, "PTY read ended");
                break;
            }
        }
    }
}

/// Writes queued input to the PTY until the queue closes or a write fails.
fn write_loop(mut writer: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(chunk) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
            tracing::debug!(error = %e, "PTY write failed");
            break;
        }
    }
}

/// Sends `signal` to the process group led by `pid`, falling back to the
/// process itself. A missing process is not an error.
fn signal_process_group(pid: u32, signal: Signal) -> Result<(), SessionError> {
    let pid = Pid::from_raw(pid as i32);
    match signal::killpg(pid, signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => match signal::kill(pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SessionError::Signal(e.to_string())),
        },
        Err(e) => Err(SessionError::Signal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn read_until(channel: &ProcessChannel, marker: &str) -> bool {
        let mut collected = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), channel.read_chunk()).await {
                Ok(Some(chunk)) => {
                    collected.push_str(&String::from_utf8_lossy(&chunk));
                    if collected.contains(marker) {
                        return true;
                    }
                }
                Ok(None) => return collected.contains(marker),
                Err(_) => {}
            }
        }
        false
    }

    #[test]
    fn test_launch_spec_builder() {
        let spec = LaunchSpec::new("sh")
            .arg("-c")
            .arg("echo hi")
            .env("FOO", "bar")
            .cwd("/tmp")
            .size(120, 40);

        assert_eq!(spec.args, vec!["-c", "echo hi"]);
        assert!(spec.has_env("FOO"));
        assert!(!spec.has_env("BAR"));
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!((spec.cols, spec.rows), (120, 40));
        assert_eq!(spec.command_line(), "sh -c echo hi");
    }

    #[test]
    fn test_start_missing_executable() {
        let result = ProcessChannel::start(&LaunchSpec::new("definitely_not_a_real_program_xyz"), 8);
        assert!(matches!(result, Err(SessionError::Spawn(_))));
    }

    #[test]
    fn test_start_invalid_cwd() {
        let spec = LaunchSpec::new("sh").cwd("/nonexistent/dir/for/ptymux");
        match ProcessChannel::start(&spec, 8) {
            Err(SessionError::Spawn(msg)) => assert!(msg.contains("working directory")),
            other => panic!("expected spawn error, got {:?}", other.err()),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_start_permission_denied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("not-executable.sh");
        std::fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

        let spec = LaunchSpec::new(script.to_string_lossy().to_string());
        assert!(matches!(
            ProcessChannel::start(&spec, 8),
            Err(SessionError::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let channel = ProcessChannel::start(&LaunchSpec::new("cat"), 8).unwrap();
        assert!(channel.is_alive());
        assert!(channel.pid().is_some());

        channel
            .write_chunk(Bytes::from_static(b"ptymux_marker\n"))
            .await
            .unwrap();
        assert!(read_until(&channel, "ptymux_marker").await);

        channel.terminate(Signal::SIGKILL).await.unwrap();
        timeout(Duration::from_secs(5), channel.wait_exit())
            .await
            .expect("process did not exit");
        channel.release().await;
    }

    #[tokio::test]
    async fn test_exit_code_and_end_of_stream() {
        let spec = LaunchSpec::new("sh").arg("-c").arg("echo done; exit 3");
        let channel = ProcessChannel::start(&spec, 8).unwrap();

        assert!(read_until(&channel, "done").await);
        let code = timeout(Duration::from_secs(5), channel.wait_exit())
            .await
            .expect("process did not exit");
        assert_eq!(code, 3);
        assert_eq!(channel.exit_code(), Some(3));
        assert!(!channel.is_alive());

        let eof = timeout(Duration::from_secs(5), async {
            while channel.read_chunk().await.is_some() {}
        })
        .await;
        assert!(eof.is_ok(), "output stream never ended");
    }

    #[tokio::test]
    async fn test_write_after_exit() {
        let spec = LaunchSpec::new("sh").arg("-c").arg("exit 0");
        let channel = ProcessChannel::start(&spec, 8).unwrap();
        timeout(Duration::from_secs(5), channel.wait_exit())
            .await
            .unwrap();

        let result = channel.write_chunk(Bytes::from_static(b"late\n")).await;
        assert!(matches!(result, Err(SessionError::WriteAfterClose)));
    }

    #[tokio::test]
    async fn test_write_after_release() {
        let channel = ProcessChannel::start(&LaunchSpec::new("cat"), 8).unwrap();
        channel.terminate(Signal::SIGKILL).await.unwrap();
        channel.release().await;
        assert!(channel.is_released());

        let result = channel.write_chunk(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(SessionError::WriteAfterClose)));
        assert!(channel.resize(100, 30).await.is_err());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let channel = ProcessChannel::start(&LaunchSpec::new("cat"), 8).unwrap();

        channel.terminate(Signal::SIGHUP).await.unwrap();
        timeout(Duration::from_secs(5), channel.wait_exit())
            .await
            .expect("SIGHUP did not stop cat");

        // Already exited: both are no-ops.
        channel.terminate(Signal::SIGHUP).await.unwrap();
        channel.terminate(Signal::SIGKILL).await.unwrap();
    }

    #[tokio::test]
    async fn test_resize() {
        let channel = ProcessChannel::start(&LaunchSpec::new("cat"), 8).unwrap();
        assert!(channel.resize(132, 43).await.is_ok());
        channel.terminate(Signal::SIGKILL).await.unwrap();
    }

    #[tokio::test]
    async fn test_env_and_cwd_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ptymux_cwd_probe"), "").unwrap();
        let spec = LaunchSpec::new("sh")
            .arg("-c")
            .arg("echo \"var=$PTYMUX_TEST_VAR\"; ls")
            .env("PTYMUX_TEST_VAR", "value_42")
            .cwd(dir.path());
        let channel = ProcessChannel::start(&spec, 8).unwrap();

        let mut collected = String::new();
        while let Ok(Some(chunk)) = timeout(Duration::from_secs(5), channel.read_chunk()).await {
            collected.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(collected.contains("var=value_42"), "output: {}", collected);
        assert!(collected.contains("ptymux_cwd_probe"), "output: {}", collected);
    }
}

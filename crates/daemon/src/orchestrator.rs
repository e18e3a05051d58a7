//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that owns the session
//! registry and serves it over the local IPC socket. It writes the PID file,
//! runs the accept loop and the idle reaper, and on shutdown terminates every
//! session before removing the socket and PID file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ipc::{pidfile, ConnectionHandler, DaemonStatus, IpcServer};
use crate::session::SessionRegistry;

/// Extra time on top of the terminate grace period for sessions to close.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

/// How long `stop` waits for background tasks to finish.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding the socket.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A CLI client connected.
    ClientConnected { connection_id: u64 },
    /// A CLI client disconnected.
    ClientDisconnected { connection_id: u64 },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Control socket path.
    socket_path: PathBuf,
    /// PID file path.
    pid_path: PathBuf,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Registry of live sessions.
    registry: Arc<SessionRegistry>,
    /// Number of open IPC connections.
    connections: Arc<AtomicUsize>,
    /// Background tasks started by `start`.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        let socket_path = config.socket_path();
        let pid_path = pidfile::pid_file_in(&config.daemon.data_dir);
        let registry = Arc::new(SessionRegistry::new(config.session.clone()));
        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            config,
            socket_path,
            pid_path,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            connections: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the daemon orchestrator.
    ///
    /// Fails if another daemon owns the PID file or the socket cannot be
    /// bound.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Orchestrator has already been shut down");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        if let Err(e) = self.bring_up().await {
            *self.state.write().await = OrchestratorState::Stopped;
            self.emit_event(OrchestratorEvent::Error {
                message: format!("{:#}", e),
            });
            self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
            return Err(e);
        }

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(socket = %self.socket_path.display(), "Daemon orchestrator started successfully");
        Ok(())
    }

    async fn bring_up(&self) -> Result<()> {
        if let Some(pid) = pidfile::read_daemon_pid(&self.pid_path) {
            if pid != std::process::id() {
                anyhow::bail!("Daemon is already running with PID {}", pid);
            }
        }

        let server = IpcServer::bind(&self.socket_path)
            .await
            .with_context(|| format!("Failed to bind socket: {}", self.socket_path.display()))?;

        pidfile::write_pid_file(&self.pid_path).with_context(|| {
            format!("Failed to write PID file: {}", self.pid_path.display())
        })?;

        let handler = ConnectionHandler::new(
            Arc::clone(&self.registry),
            DaemonStatus::current(),
            self.shutdown_token.clone(),
        );

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Self::accept_loop(
            server,
            handler,
            self.shutdown_token.clone(),
            self.event_tx.clone(),
            Arc::clone(&self.connections),
        )));
        debug!("Started IPC accept loop");

        if let Some(reaper) = self
            .registry
            .start_idle_reaper(self.shutdown_token.clone())
        {
            tasks.push(reaper);
            debug!(
                idle_timeout_secs = self.config.session.idle_timeout_secs,
                "Started idle session reaper"
            );
        }

        Ok(())
    }

    /// Accepts IPC connections until shutdown.
    async fn accept_loop(
        server: IpcServer,
        handler: ConnectionHandler<SessionRegistry>,
        shutdown_token: CancellationToken,
        event_tx: broadcast::Sender<OrchestratorEvent>,
        connections: Arc<AtomicUsize>,
    ) {
        let next_id = AtomicU64::new(1);

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    info!("Accept loop received shutdown signal");
                    break;
                }
                accepted = server.accept() => match accepted {
                    Ok(conn) => {
                        let connection_id = next_id.fetch_add(1, Ordering::Relaxed);
                        debug!(connection_id, "IPC client connected");
                        connections.fetch_add(1, Ordering::Relaxed);
                        let _ = event_tx.send(OrchestratorEvent::ClientConnected { connection_id });

                        let handler = handler.clone();
                        let event_tx = event_tx.clone();
                        let connections = Arc::clone(&connections);
                        tokio::spawn(async move {
                            handler.handle(conn).await;
                            connections.fetch_sub(1, Ordering::Relaxed);
                            debug!(connection_id, "IPC client disconnected");
                            let _ = event_tx.send(OrchestratorEvent::ClientDisconnected { connection_id });
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept IPC connection: {}", e);
                        let _ = event_tx.send(OrchestratorEvent::Error {
                            message: e.to_string(),
                        });
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    /// Stops the daemon orchestrator gracefully.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();

        let grace = Duration::from_millis(self.config.session.terminate_grace_ms) + SHUTDOWN_SLACK;
        let lingering = self.registry.shutdown(grace).await;
        if lingering > 0 {
            warn!(lingering, "Some sessions did not close before shutdown");
        }

        for task in self.tasks.lock().await.drain(..) {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await.is_err() {
                warn!("Background task did not finish in time");
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Error removing socket {:?}: {}", self.socket_path, e);
            }
        }
        pidfile::remove_pid_file(&self.pid_path);

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the control socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Returns the PID file path.
    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    /// Returns the number of open IPC connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    ///
    /// It is also cancelled when a client sends a stop request.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcClient;
    use crate::session::LaunchSpec;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().join("data");
        config.ipc.socket_path = Some(temp_dir.path().join("run").join("daemon.sock"));
        config.session.default_shell = "/bin/sh".to_string();
        config.session.terminate_grace_ms = 300;
        config
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);

        let orchestrator = DaemonOrchestrator::new(config).unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert_eq!(
            orchestrator.pid_path(),
            temp_dir.path().join("data").join("daemon.pid")
        );
        assert_eq!(orchestrator.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(orchestrator.socket_path().exists());
        assert_eq!(
            pidfile::read_daemon_pid(orchestrator.pid_path()),
            Some(std::process::id())
        );

        let mut client = IpcClient::connect(orchestrator.socket_path()).await.unwrap();
        assert!(client.ping().await.unwrap());
        drop(client);

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(!orchestrator.socket_path().exists());
        assert!(!orchestrator.pid_path().exists());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();

        orchestrator.start().await.unwrap();
        assert!(orchestrator.start().await.is_err());
        orchestrator.stop().await.unwrap();

        // Stopping twice is a no-op.
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_refuses_live_pid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let pid_path = pidfile::pid_file_in(&config.daemon.data_dir);
        std::fs::create_dir_all(&config.daemon.data_dir).unwrap();
        // PID 1 is always alive.
        std::fs::write(&pid_path, "1\n").unwrap();

        let orchestrator = DaemonOrchestrator::new(config).unwrap();
        let err = orchestrator.start().await.unwrap_err();
        assert!(err.to_string().contains("already running"));
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_terminates_sessions() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        orchestrator.start().await.unwrap();

        let session = orchestrator
            .registry()
            .create(LaunchSpec::new("cat"))
            .await
            .unwrap();

        orchestrator.stop().await.unwrap();
        assert_eq!(session.state(), crate::session::SessionState::Closed);
        assert!(orchestrator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_stop_request_over_ipc() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        orchestrator.start().await.unwrap();

        let mut client = IpcClient::connect(orchestrator.socket_path()).await.unwrap();
        client.stop().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), orchestrator.shutdown_token().cancelled())
            .await
            .unwrap();
        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }
}

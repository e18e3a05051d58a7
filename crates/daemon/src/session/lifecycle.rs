//! Session lifecycle.
//!
//! A [`Session`] couples one [`ProcessChannel`] to a dynamic set of
//! subscribers and moves through `starting → active → closing → closed`
//! without skipping a state. A single pump task per session is the only
//! reader of the channel and the only producer into subscriber queues.
//!
//! Termination sends `SIGHUP` to the process group and escalates to
//! `SIGKILL` if the process is still alive after the configured grace
//! period, so every session converges to `closed`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::Signal;
use ptymux_protocol::{now_millis, SessionStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::SessionError;
use super::multiplexer::{
    SubscriberEvent, SubscriberHandle, SubscriberId, SubscriberSet, SubscriberStats,
    SubscriberStream, DEFAULT_QUEUE_CAPACITY,
};
use super::pty::{LaunchSpec, ProcessChannel};
use super::SessionId;
use crate::config::SessionConfig;

/// How long the pump waits for each trailing chunk after the process exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// The process is being spawned.
    Starting,
    /// The process runs and input is accepted.
    Active,
    /// Termination requested or the process exited; input is refused.
    Closing,
    /// Resources released and the session removed. Terminal.
    Closed,
}

impl SessionState {
    /// Returns whether new subscribers may attach.
    pub fn accepts_subscribers(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Active)
    }

    /// Returns whether input is accepted.
    pub fn accepts_input(self) -> bool {
        self == SessionState::Active
    }
}

impl From<SessionState> for SessionStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Starting => SessionStatus::Starting,
            SessionState::Active => SessionStatus::Active,
            SessionState::Closing => SessionStatus::Closing,
            SessionState::Closed => SessionStatus::Closed,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        SessionStatus::from(*self).fmt(f)
    }
}

/// Registry-wide lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session was created and registered.
    Created { session_id: SessionId },
    /// A session changed state.
    StateChanged {
        session_id: SessionId,
        state: SessionState,
    },
    /// A session was removed from the registry.
    Removed {
        session_id: SessionId,
        exit_code: Option<i32>,
    },
}

/// Per-session tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Output chunks buffered per subscriber before dropping.
    pub subscriber_queue_capacity: usize,
    /// Input chunks buffered before `submit_input` reports back-pressure.
    pub input_queue_capacity: usize,
    /// Time between `SIGHUP` and `SIGKILL` when terminating.
    pub terminate_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            input_queue_capacity: 256,
            terminate_grace: Duration::from_secs(2),
        }
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            subscriber_queue_capacity: config.subscriber_queue_capacity,
            input_queue_capacity: config.input_queue_capacity,
            terminate_grace: Duration::from_millis(config.terminate_grace_ms),
        }
    }
}

/// Read-only snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Unique session identifier.
    pub id: SessionId,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Process ID of the program.
    pub pid: Option<u32>,
    /// Program and arguments.
    pub command: String,
    /// Working directory, if one was requested.
    pub cwd: Option<String>,
    /// Creation time in Unix milliseconds.
    pub created_at: u64,
    /// Last input or output in Unix milliseconds.
    pub last_activity_at: u64,
    /// Number of attached subscribers.
    pub subscribers: usize,
    /// Exit code, once the process exited.
    pub exit_code: Option<i32>,
}

/// Called with the session id during the `closing → closed` transition.
pub(crate) type ClosedHook = Arc<dyn Fn(&SessionId, Option<i32>) + Send + Sync>;

struct SessionInner {
    state: SessionState,
    subscribers: SubscriberSet,
}

/// A running program plus the subscribers watching it.
pub struct Session {
    id: SessionId,
    launch: LaunchSpec,
    created_at: u64,
    channel: ProcessChannel,
    inner: RwLock<SessionInner>,
    state_tx: watch::Sender<SessionState>,
    last_activity: AtomicU64,
    subscriber_count: AtomicUsize,
    terminate_token: CancellationToken,
    pump_started: AtomicBool,
    finalized: AtomicBool,
    settings: SessionSettings,
    events: broadcast::Sender<SessionEvent>,
    on_closed: Option<ClosedHook>,
}

impl Session {
    /// Spawns the process and returns the session in `starting`.
    ///
    /// Nothing is pumped until [`Session::activate`] is called.
    pub(crate) fn spawn(
        id: SessionId,
        launch: LaunchSpec,
        settings: SessionSettings,
        events: broadcast::Sender<SessionEvent>,
        on_closed: Option<ClosedHook>,
    ) -> Result<Arc<Self>, SessionError> {
        let channel = ProcessChannel::start(&launch, settings.input_queue_capacity)?;
        let (state_tx, _) = watch::channel(SessionState::Starting);
        let now = now_millis();

        Ok(Arc::new(Self {
            id,
            launch,
            created_at: now,
            channel,
            inner: RwLock::new(SessionInner {
                state: SessionState::Starting,
                subscribers: SubscriberSet::new(),
            }),
            state_tx,
            last_activity: AtomicU64::new(now),
            subscriber_count: AtomicUsize::new(0),
            terminate_token: CancellationToken::new(),
            pump_started: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            settings,
            events,
            on_closed,
        }))
    }

    /// Spawns and activates a session that belongs to no registry.
    pub async fn start(
        launch: LaunchSpec,
        settings: SessionSettings,
    ) -> Result<Arc<Self>, SessionError> {
        let (events, _) = broadcast::channel(64);
        let session = Self::spawn(uuid::Uuid::new_v4().to_string(), launch, settings, events, None)?;
        session.activate().await;
        Ok(session)
    }

    /// Moves `starting → active` and schedules the pump. Runs once.
    pub(crate) async fn activate(self: &Arc<Self>) {
        if self.pump_started.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut inner = self.inner.write().await;
            if inner.state == SessionState::Starting {
                self.set_state_locked(&mut inner, SessionState::Active, None);
            }
        }
        tokio::spawn(Arc::clone(self).run_pump());
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the launch parameters.
    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    /// Returns the process ID of the program, if available.
    pub fn pid(&self) -> Option<u32> {
        self.channel.pid()
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Returns a receiver that observes state changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Returns the exit code once the process exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.channel.exit_code()
    }

    /// Returns the creation time in Unix milliseconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Returns the time of the last input or output in Unix milliseconds.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Returns how long the session has seen no input or output.
    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.last_activity()))
    }

    /// Returns the number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Relaxed)
    }

    /// Returns a snapshot for listings.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            state: self.state(),
            pid: self.pid(),
            command: self.launch.command_line(),
            cwd: self
                .launch
                .cwd
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            created_at: self.created_at,
            last_activity_at: self.last_activity(),
            subscribers: self.subscriber_count(),
            exit_code: self.exit_code(),
        }
    }

    /// Attaches a new subscriber.
    ///
    /// The stream first yields the current state, then live output.
    ///
    /// # Errors
    /// [`SessionError::Terminated`] once the session is closing or closed.
    pub async fn attach(&self) -> Result<SubscriberStream, SessionError> {
        self.attach_with_capacity(self.settings.subscriber_queue_capacity)
            .await
    }

    /// Attaches a new subscriber with a specific output queue capacity.
    pub async fn attach_with_capacity(
        &self,
        capacity: usize,
    ) -> Result<SubscriberStream, SessionError> {
        let mut inner = self.inner.write().await;
        if !inner.state.accepts_subscribers() {
            return Err(SessionError::Terminated(self.id.clone()));
        }

        let (handle, stream) = SubscriberHandle::new(self.id.clone(), capacity);
        let stream = stream.with_initial(SubscriberEvent::StateChanged {
            state: inner.state,
            exit_code: None,
        });
        inner.subscribers.insert(handle);
        self.subscriber_count
            .store(inner.subscribers.len(), Ordering::Relaxed);

        debug!(
            session_id = %self.id,
            subscriber_id = %stream.id(),
            subscribers = inner.subscribers.len(),
            "Subscriber attached"
        );
        Ok(stream)
    }

    /// Detaches a subscriber. Idempotent; never affects the process.
    ///
    /// Returns the subscriber's final statistics if it was attached.
    pub async fn detach(&self, subscriber_id: &str) -> Option<SubscriberStats> {
        let mut inner = self.inner.write().await;
        let stats = inner.subscribers.remove(subscriber_id);
        self.subscriber_count
            .store(inner.subscribers.len(), Ordering::Relaxed);

        if let Some(ref stats) = stats {
            debug!(
                session_id = %self.id,
                subscriber_id = %subscriber_id,
                sent = stats.chunks_sent,
                dropped = stats.chunks_dropped,
                "Subscriber detached"
            );
        }
        stats
    }

    /// Returns the IDs of all attached subscribers.
    pub async fn subscriber_ids(&self) -> Vec<SubscriberId> {
        self.inner.read().await.subscribers.ids()
    }

    /// Forwards input to the process.
    ///
    /// # Errors
    /// [`SessionError::Terminated`] unless the session is active;
    /// [`SessionError::WriteAfterClose`] if the process channel closed
    /// underneath; [`SessionError::InputBackpressure`] if the process is not
    /// reading its input.
    pub async fn submit_input(&self, data: &[u8]) -> Result<(), SessionError> {
        let inner = self.inner.read().await;
        if !inner.state.accepts_input() {
            return Err(SessionError::Terminated(self.id.clone()));
        }
        self.channel
            .write_chunk(Bytes::copy_from_slice(data))
            .await?;
        self.touch();
        Ok(())
    }

    /// Resizes the terminal window.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let inner = self.inner.read().await;
        if !inner.state.accepts_input() {
            return Err(SessionError::Terminated(self.id.clone()));
        }
        self.channel.resize(cols, rows).await?;
        debug!(session_id = %self.id, cols, rows, "Resized session");
        Ok(())
    }

    /// Requests termination with `SIGHUP`. Idempotent.
    pub async fn terminate(&self) -> Result<(), SessionError> {
        self.terminate_with(Signal::SIGHUP).await
    }

    /// Requests termination with `signal`.
    ///
    /// Only the first request signals the process; later requests are no-ops
    /// except `SIGKILL`, which is always delivered. The pump escalates to
    /// `SIGKILL` after the grace period.
    pub async fn terminate_with(&self, signal: Signal) -> Result<(), SessionError> {
        if self.state() == SessionState::Closed {
            return Ok(());
        }

        self.begin_closing().await;
        let repeated = self.terminate_token.is_cancelled();
        self.terminate_token.cancel();

        if !repeated || signal == Signal::SIGKILL {
            info!(session_id = %self.id, signal = %signal, "Terminating session");
            self.channel.terminate(signal).await?;
        }
        Ok(())
    }

    /// Resolves once the session is closed.
    pub async fn wait_closed(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Applies a state change and tells everyone about it.
    fn set_state_locked(
        &self,
        inner: &mut SessionInner,
        state: SessionState,
        exit_code: Option<i32>,
    ) {
        inner.state = state;
        inner
            .subscribers
            .notify_all(SubscriberEvent::StateChanged { state, exit_code });
        let _ = self.events.send(SessionEvent::StateChanged {
            session_id: self.id.clone(),
            state,
        });
        self.state_tx.send_replace(state);
        debug!(session_id = %self.id, state = %state, "Session state changed");
    }

    /// Moves to `closing` if still starting or active. Returns true if this
    /// call made the transition.
    async fn begin_closing(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.state.accepts_subscribers() {
            self.set_state_locked(&mut inner, SessionState::Closing, None);
            true
        } else {
            false
        }
    }

    async fn publish(&self, chunk: Bytes) {
        self.touch();
        let mut inner = self.inner.write().await;
        inner.subscribers.broadcast(&chunk);
        self.subscriber_count
            .store(inner.subscribers.len(), Ordering::Relaxed);
    }

    async fn run_pump(self: Arc<Self>) {
        debug!(session_id = %self.id, pid = ?self.pid(), "Pump started");

        let mut escalate_at: Option<Instant> = None;
        let mut escalated = false;
        let mut exit_code = None;

        loop {
            tokio::select! {
                biased;
                _ = sleep_until(escalate_at.unwrap_or_else(Instant::now)), if escalate_at.is_some() => {
                    escalate_at = None;
                    escalated = true;
                    self.force_kill().await;
                }
                _ = self.terminate_token.cancelled(), if escalate_at.is_none() && !escalated => {
                    escalate_at = Some(Instant::now() + self.settings.terminate_grace);
                }
                chunk = self.channel.read_chunk() => match chunk {
                    Some(chunk) => self.publish(chunk).await,
                    None => break,
                },
                code = self.channel.wait_exit() => {
                    exit_code = Some(code);
                    break;
                }
            }
        }

        if self.begin_closing().await {
            info!(session_id = %self.id, "Process ended, closing session");
        }

        let exit_code = match exit_code {
            Some(code) => {
                self.drain_output().await;
                code
            }
            None => self.await_exit(escalate_at, escalated).await,
        };

        self.finalize(exit_code).await;
    }

    /// Publishes output still buffered after the process exited.
    async fn drain_output(&self) {
        while let Ok(Some(chunk)) = timeout(DRAIN_TIMEOUT, self.channel.read_chunk()).await {
            self.publish(chunk).await;
        }
    }

    /// Waits for the exit status after end of output, killing the process if
    /// it lingers past the grace period.
    async fn await_exit(&self, escalate_at: Option<Instant>, escalated: bool) -> i32 {
        if !escalated {
            let deadline =
                escalate_at.unwrap_or_else(|| Instant::now() + self.settings.terminate_grace);
            if let Ok(code) = tokio::time::timeout_at(deadline, self.channel.wait_exit()).await {
                return code;
            }
            self.force_kill().await;
        }
        self.channel.wait_exit().await
    }

    async fn force_kill(&self) {
        if !self.channel.is_alive() {
            return;
        }
        warn!(
            session_id = %self.id,
            grace_ms = self.settings.terminate_grace.as_millis() as u64,
            "Process did not exit within grace period, sending SIGKILL"
        );
        if let Err(e) = self.channel.terminate(Signal::SIGKILL).await {
            warn!(session_id = %self.id, error = %e, "Failed to kill process");
        }
    }

    /// `closing → closed`: release the channel, leave the registry, notify
    /// and drop every subscriber. Runs once.
    async fn finalize(&self, exit_code: i32) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }

        self.begin_closing().await;
        self.channel.release().await;

        if let Some(hook) = &self.on_closed {
            hook(&self.id, Some(exit_code));
        }

        {
            let mut inner = self.inner.write().await;
            self.set_state_locked(&mut inner, SessionState::Closed, Some(exit_code));
            inner.subscribers.clear();
        }
        self.subscriber_count.store(0, Ordering::Relaxed);

        info!(session_id = %self.id, exit_code, "Session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .field("command", &self.launch.command_line())
            .finish()
    }
}

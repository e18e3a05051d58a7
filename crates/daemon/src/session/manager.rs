//! Session registry.
//!
//! The [`SessionRegistry`] maps session ids to live [`Session`]s. It owns
//! creation, enforces the configured session limit and is drained at
//! shutdown. A session removes itself from the registry as part of its
//! `closing → closed` transition, so a listing never shows a closed session.
//!
//! [`SessionControl`] is the operation surface transports program against.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use nix::sys::signal::Signal;
use ptymux_protocol::{SessionCreate, SessionCreated};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::SessionError;
use super::lifecycle::{
    ClosedHook, Session, SessionEvent, SessionSettings, SessionState, SessionSummary,
};
use super::multiplexer::SubscriberStream;
use super::pty::LaunchSpec;
use super::SessionId;
use crate::config::SessionConfig;

/// Capacity of the registry-wide event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Operations a transport adapter performs against the session core.
///
/// Implementations must be thread-safe and suitable for concurrent access.
#[allow(async_fn_in_trait)]
pub trait SessionControl: Send + Sync {
    /// Creates a session from launch parameters.
    async fn create_session(&self, request: SessionCreate)
        -> Result<SessionCreated, SessionError>;

    /// Attaches a new subscriber to a session.
    async fn attach_subscriber(&self, session_id: &str)
        -> Result<SubscriberStream, SessionError>;

    /// Detaches a subscriber. Detaching from a session that already closed
    /// succeeds.
    async fn detach_subscriber(
        &self,
        session_id: &str,
        subscriber_id: &str,
    ) -> Result<(), SessionError>;

    /// Forwards input to a session's process.
    async fn submit_input(&self, session_id: &str, data: &[u8]) -> Result<(), SessionError>;

    /// Requests termination, optionally with a specific signal.
    async fn terminate_session(
        &self,
        session_id: &str,
        signal: Option<Signal>,
    ) -> Result<(), SessionError>;

    /// Resizes a session's terminal.
    async fn resize_session(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError>;

    /// Lists sessions that are not closed.
    fn list_sessions(&self) -> Vec<SessionSummary>;
}

struct RegistryShared {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Slots taken by registered sessions and creations in flight.
    slots: AtomicUsize,
    config: SessionConfig,
    events: broadcast::Sender<SessionEvent>,
}

/// Thread-safe registry of live sessions backed by DashMap.
///
/// Cloning is cheap; clones share the same map.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<RegistryShared>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(RegistryShared {
                sessions: DashMap::new(),
                slots: AtomicUsize::new(0),
                config,
                events,
            }),
        }
    }

    /// Returns the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Returns a receiver for registry-wide lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Builds launch parameters from a create request, filling in the
    /// default shell and `TERM`.
    pub fn launch_spec(&self, request: SessionCreate) -> LaunchSpec {
        let program = request
            .command
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.shared.config.default_shell.clone());

        let mut launch = LaunchSpec::new(program)
            .args(request.args)
            .size(request.cols, request.rows);
        launch.env = request.env;
        if let Some(cwd) = request.cwd {
            launch = launch.cwd(cwd);
        }
        if !launch.has_env("TERM") && !self.shared.config.term.is_empty() {
            launch = launch.env("TERM", self.shared.config.term.clone());
        }
        launch
    }

    /// Creates, starts and registers a session.
    ///
    /// # Errors
    /// [`SessionError::LimitReached`] if `max_sessions` sessions are live;
    /// [`SessionError::Spawn`] if the process cannot be started, in which case
    /// nothing is registered.
    pub async fn create(&self, launch: LaunchSpec) -> Result<Arc<Session>, SessionError> {
        self.reserve_slot()?;

        let id = Uuid::new_v4().to_string();
        let session = match Session::spawn(
            id.clone(),
            launch,
            SessionSettings::from(&self.shared.config),
            self.shared.events.clone(),
            Some(self.closed_hook()),
        ) {
            Ok(session) => session,
            Err(e) => {
                self.release_slot();
                tracing::warn!(error = %e, "Failed to start session");
                return Err(e);
            }
        };

        self.shared.sessions.insert(id.clone(), Arc::clone(&session));
        let _ = self.shared.events.send(SessionEvent::Created {
            session_id: id.clone(),
        });
        session.activate().await;

        tracing::info!(
            session_id = %id,
            pid = ?session.pid(),
            command = %session.launch().command_line(),
            "Created new session"
        );

        Ok(session)
    }

    /// Looks up a live session.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] for unknown or already closed ids.
    pub fn get(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        match self.shared.sessions.get(session_id) {
            Some(entry) => Ok(Arc::clone(entry.value())),
            None => {
                tracing::debug!(session_id = %session_id, "Session not found");
                Err(SessionError::NotFound(session_id.to_string()))
            }
        }
    }

    /// Returns a snapshot of sessions that are not closed, oldest first.
    pub fn list_active(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .snapshot()
            .iter()
            .map(|session| session.summary())
            .filter(|summary| summary.state != SessionState::Closed)
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Returns the number of registered sessions.
    pub fn len(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Returns whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.shared.sessions.is_empty()
    }

    /// Terminates active sessions that have no subscribers and saw no input
    /// or output for at least `threshold`.
    ///
    /// Returns the ids of the sessions asked to terminate.
    pub async fn reap_idle(&self, threshold: Duration) -> Vec<SessionId> {
        let mut reaped = Vec::new();

        for session in self.snapshot() {
            if session.state() != SessionState::Active
                || session.subscriber_count() > 0
                || session.idle_for() < threshold
            {
                continue;
            }

            tracing::info!(
                session_id = %session.id(),
                idle_secs = session.idle_for().as_secs(),
                "Terminating idle session"
            );
            match session.terminate().await {
                Ok(()) => reaped.push(session.id().clone()),
                Err(e) => tracing::warn!(
                    session_id = %session.id(),
                    error = %e,
                    "Failed to terminate idle session"
                ),
            }
        }

        reaped
    }

    /// Starts a background task that periodically reaps idle sessions.
    ///
    /// Returns `None` when `idle_timeout_secs` is 0.
    pub fn start_idle_reaper(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.shared.config.idle_timeout_secs == 0 {
            return None;
        }

        let registry = self.clone();
        let threshold = Duration::from_secs(self.shared.config.idle_timeout_secs);
        let interval = Duration::from_secs(self.shared.config.reap_interval_secs.max(1));

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.reap_idle(threshold).await;
                    }
                }
            }
            tracing::debug!("Idle reaper stopped");
        }))
    }

    /// Terminates every session and waits up to `timeout` for all of them to
    /// close.
    ///
    /// Returns the number of sessions that did not close in time.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let sessions = self.snapshot();
        if sessions.is_empty() {
            return 0;
        }

        tracing::info!(count = sessions.len(), "Terminating all sessions");
        for session in &sessions {
            if let Err(e) = session.terminate().await {
                tracing::warn!(session_id = %session.id(), error = %e, "Error terminating session");
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut lingering = 0;
        for session in &sessions {
            if tokio::time::timeout_at(deadline, session.wait_closed())
                .await
                .is_err()
            {
                tracing::warn!(session_id = %session.id(), "Session did not close before shutdown deadline");
                lingering += 1;
            }
        }
        lingering
    }

    /// Clones the current sessions out of the map so no shard lock is held
    /// across an await.
    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.shared
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Removes a closed session and announces it. Only the session's own
    /// `closing → closed` transition calls this.
    pub(crate) fn remove(
        &self,
        session_id: &str,
        exit_code: Option<i32>,
    ) -> Option<Arc<Session>> {
        let removed = self
            .shared
            .sessions
            .remove(session_id)
            .map(|(_, session)| session);
        if removed.is_some() {
            self.release_slot();
        }
        let _ = self.shared.events.send(SessionEvent::Removed {
            session_id: session_id.to_string(),
            exit_code,
        });
        tracing::debug!(session_id = %session_id, "Removed session from registry");
        removed
    }

    fn reserve_slot(&self) -> Result<(), SessionError> {
        let max = self.shared.config.max_sessions;
        self.shared
            .slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |taken| {
                (taken < max).then_some(taken + 1)
            })
            .map(|_| ())
            .map_err(|_| SessionError::LimitReached(max))
    }

    fn release_slot(&self) {
        self.shared.slots.fetch_sub(1, Ordering::SeqCst);
    }

    /// Builds the hook a session runs on `closing → closed`. The hook holds
    /// the registry weakly.
    fn closed_hook(&self) -> ClosedHook {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |session_id: &SessionId, exit_code: Option<i32>| {
            if let Some(shared) = shared.upgrade() {
                SessionRegistry { shared }.remove(session_id, exit_code);
            }
        })
    }
}

impl SessionControl for SessionRegistry {
    async fn create_session(
        &self,
        request: SessionCreate,
    ) -> Result<SessionCreated, SessionError> {
        let launch = self.launch_spec(request);
        let session = self.create(launch).await?;
        Ok(SessionCreated {
            session_id: session.id().clone(),
            pid: session.pid(),
        })
    }

    async fn attach_subscriber(&self, session_id: &str) -> Result<SubscriberStream, SessionError> {
        self.get(session_id)?.attach().await
    }

    async fn detach_subscriber(
        &self,
        session_id: &str,
        subscriber_id: &str,
    ) -> Result<(), SessionError> {
        match self.get(session_id) {
            Ok(session) => {
                session.detach(subscriber_id).await;
                Ok(())
            }
            // The session closed and dropped its subscribers already.
            Err(SessionError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn submit_input(&self, session_id: &str, data: &[u8]) -> Result<(), SessionError> {
        self.get(session_id)?.submit_input(data).await
    }

    async fn terminate_session(
        &self,
        session_id: &str,
        signal: Option<Signal>,
    ) -> Result<(), SessionError> {
        let session = self.get(session_id)?;
        match signal {
            Some(signal) => session.terminate_with(signal).await,
            None => session.terminate().await,
        }
    }

    async fn resize_session(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError> {
        self.get(session_id)?.resize(cols, rows).await
    }

    fn list_sessions(&self) -> Vec<SessionSummary> {
        self.list_active()
    }
}

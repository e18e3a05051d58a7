//! Per-connection request handling.
//!
//! A [`ConnectionHandler`] serves one client connection against a
//! [`SessionControl`] implementation. Responses and streamed terminal
//! messages share one outgoing queue drained by a writer task, so an attached
//! client keeps receiving output while it sends input.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use ptymux_protocol::{ErrorCode, TerminalMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{IpcRequest, IpcResponse};
use super::server::{IpcConnection, IpcError};
use crate::session::{
    SessionControl, SessionError, SessionId, SessionState, SubscriberEvent, SubscriberId,
    SubscriberStream,
};

/// Responses and terminal messages queued per connection.
const OUTGOING_QUEUE_CAPACITY: usize = 256;

/// How long a closing connection may spend flushing queued responses.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Daemon facts reported by `Status`.
#[derive(Debug, Clone, Copy)]
pub struct DaemonStatus {
    /// Daemon process ID.
    pub pid: u32,
    /// When the daemon started serving.
    pub started_at: Instant,
}

impl DaemonStatus {
    /// Status for the current process, starting now.
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Instant::now(),
        }
    }
}

struct Attachment {
    subscriber_id: SubscriberId,
    forwarder: JoinHandle<()>,
}

/// Serves IPC connections against a session control surface.
pub struct ConnectionHandler<S: SessionControl> {
    control: Arc<S>,
    status: DaemonStatus,
    stop: CancellationToken,
}

impl<S: SessionControl> Clone for ConnectionHandler<S> {
    fn clone(&self) -> Self {
        Self {
            control: Arc::clone(&self.control),
            status: self.status,
            stop: self.stop.clone(),
        }
    }
}

impl<S: SessionControl> ConnectionHandler<S> {
    /// Creates a handler. `stop` is cancelled when a client requests
    /// shutdown, and ends every connection when cancelled elsewhere.
    pub fn new(control: Arc<S>, status: DaemonStatus, stop: CancellationToken) -> Self {
        Self {
            control,
            status,
            stop,
        }
    }

    /// Serves a connection until the client disconnects or the daemon stops.
    ///
    /// Every subscriber attached through this connection is detached on exit.
    pub async fn handle(&self, conn: IpcConnection) {
        let (mut reader, mut writer) = conn.into_split();
        let (tx, mut rx) = mpsc::channel::<IpcResponse>(OUTGOING_QUEUE_CAPACITY);

        let writer_task = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                if let Err(e) = writer.send_response(&response).await {
                    debug!("IPC client went away: {}", e);
                    break;
                }
            }
        });

        let mut attachments: HashMap<SessionId, Attachment> = HashMap::new();

        loop {
            let request = tokio::select! {
                _ = self.stop.cancelled() => break,
                request = reader.read_request() => request,
            };

            match request {
                Ok(Some(request)) => {
                    let is_stop = request == IpcRequest::Stop;
                    if let Some(response) = self.dispatch(request, &tx, &mut attachments).await {
                        if tx.send(response).await.is_err() {
                            break;
                        }
                    }
                    if is_stop {
                        info!("Stop requested over IPC");
                        self.stop.cancel();
                        break;
                    }
                }
                Ok(None) => break,
                Err(IpcError::Json(e)) => {
                    let response =
                        IpcResponse::error(ErrorCode::InvalidRequest, format!("invalid request: {}", e));
                    if tx.send(response).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("IPC read failed: {}", e);
                    break;
                }
            }
        }

        for (session_id, attachment) in attachments.drain() {
            if let Err(e) = self
                .control
                .detach_subscriber(&session_id, &attachment.subscriber_id)
                .await
            {
                warn!(session_id = %session_id, error = %e, "Failed to detach on disconnect");
            }
            attachment.forwarder.abort();
        }

        drop(tx);
        if tokio::time::timeout(FLUSH_TIMEOUT, writer_task).await.is_err() {
            debug!("Timed out flushing IPC responses");
        }
    }

    /// Applies one request. Returns the response to queue, if any.
    async fn dispatch(
        &self,
        request: IpcRequest,
        tx: &mpsc::Sender<IpcResponse>,
        attachments: &mut HashMap<SessionId, Attachment>,
    ) -> Option<IpcResponse> {
        let response = match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => {
                let sessions = self.control.list_sessions();
                IpcResponse::Status {
                    running: true,
                    pid: self.status.pid,
                    uptime_secs: self.status.started_at.elapsed().as_secs(),
                    session_count: sessions.len(),
                    subscriber_count: sessions.iter().map(|s| s.subscribers).sum(),
                }
            }
            IpcRequest::Stop => IpcResponse::Stopping,
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.control.list_sessions(),
            },
            IpcRequest::CreateSession(create) => {
                match self.control.create_session(create).await {
                    Ok(created) => IpcResponse::SessionCreated(created),
                    Err(e) => session_error(e),
                }
            }
            IpcRequest::AttachSession { session_id } => {
                return self.attach(session_id, tx, attachments).await;
            }
            IpcRequest::DetachSession { session_id } => match attachments.remove(&session_id) {
                Some(attachment) => {
                    let result = self
                        .control
                        .detach_subscriber(&session_id, &attachment.subscriber_id)
                        .await;
                    attachment.forwarder.abort();
                    match result {
                        Ok(()) => IpcResponse::Detached { session_id },
                        Err(e) => session_error(e),
                    }
                }
                None => IpcResponse::Detached { session_id },
            },
            IpcRequest::Input(message) => match message {
                TerminalMessage::Input {
                    session_id, data, ..
                } => match self.control.submit_input(&session_id, &data).await {
                    Ok(()) => IpcResponse::Ack,
                    Err(e) => session_error(e),
                },
                other => IpcResponse::error(
                    ErrorCode::InvalidRequest,
                    format!("expected an input message for session {}", other.session_id()),
                ),
            },
            IpcRequest::ResizeSession {
                session_id,
                cols,
                rows,
            } => match self.control.resize_session(&session_id, cols, rows).await {
                Ok(()) => IpcResponse::Ack,
                Err(e) => session_error(e),
            },
            IpcRequest::KillSession { session_id, signal } => {
                let signal = match signal.map(Signal::try_from).transpose() {
                    Ok(signal) => signal,
                    Err(_) => {
                        return Some(IpcResponse::error(
                            ErrorCode::InvalidRequest,
                            format!("invalid signal: {}", signal.unwrap_or_default()),
                        ))
                    }
                };
                match self.control.terminate_session(&session_id, signal).await {
                    Ok(()) => IpcResponse::SessionKilled { session_id },
                    Err(e) => session_error(e),
                }
            }
        };
        Some(response)
    }

    async fn attach(
        &self,
        session_id: SessionId,
        tx: &mpsc::Sender<IpcResponse>,
        attachments: &mut HashMap<SessionId, Attachment>,
    ) -> Option<IpcResponse> {
        if let Some(existing) = attachments.get(&session_id) {
            if !existing.forwarder.is_finished() {
                return Some(IpcResponse::Attached {
                    subscriber_id: existing.subscriber_id.clone(),
                    session_id,
                });
            }
        }

        let stream = match self.control.attach_subscriber(&session_id).await {
            Ok(stream) => stream,
            Err(e) => return Some(session_error(e)),
        };
        let subscriber_id = stream.id().clone();

        // Confirm before any streamed message so clients see the ack first.
        let attached = IpcResponse::Attached {
            session_id: session_id.clone(),
            subscriber_id: subscriber_id.clone(),
        };
        if tx.send(attached).await.is_err() {
            let _ = self.control.detach_subscriber(&session_id, &subscriber_id).await;
            return None;
        }

        let forwarder = tokio::spawn(forward_events(stream, tx.clone()));
        attachments.insert(
            session_id,
            Attachment {
                subscriber_id,
                forwarder,
            },
        );
        None
    }
}

/// Converts subscriber events into terminal envelopes on the outgoing queue.
async fn forward_events(mut stream: SubscriberStream, tx: mpsc::Sender<IpcResponse>) {
    let session_id = stream.session_id().clone();
    while let Some(event) = stream.recv().await {
        let message = match event {
            SubscriberEvent::Output(chunk) => TerminalMessage::output(&session_id, chunk.to_vec()),
            SubscriberEvent::StateChanged {
                state: SessionState::Closed,
                exit_code,
            } => TerminalMessage::closed(&session_id, exit_code),
            SubscriberEvent::StateChanged { state, .. } => {
                TerminalMessage::status(&session_id, state.into())
            }
            SubscriberEvent::DataDropped { dropped } => {
                TerminalMessage::data_dropped(&session_id, dropped)
            }
        };
        if tx.send(IpcResponse::Terminal(message)).await.is_err() {
            break;
        }
    }
    debug!(session_id = %session_id, subscriber_id = %stream.id(), "Subscriber stream ended");
}

fn session_error(error: SessionError) -> IpcResponse {
    IpcResponse::error(error.code(), error.to_string())
}

//! IPC Client for communicating with the daemon via Unix Domain Sockets.
//!
//! Requests follow a request-response pattern. Once the connection attaches
//! to a session, the daemon also pushes [`IpcResponse::Terminal`] messages;
//! the client buffers those while it waits for a reply and hands them out
//! through [`IpcClient::next_event`].

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::time::Duration;

use ptymux_protocol::{SessionCreate, SessionCreated, TerminalMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;
use crate::session::{SessionSummary, SubscriberId};

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: IpcEventReader,
    writer: IpcRequestWriter,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    /// This typically indicates that the daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(
            stream,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        ))
    }

    /// Connect to the daemon with a custom timeout.
    ///
    /// The timeout applies to connecting and to every request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))??;
        Ok(Self::from_stream(stream, timeout))
    }

    fn from_stream(stream: UnixStream, timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: IpcEventReader {
                inner: BufReader::new(read_half),
                pending: VecDeque::new(),
                line: Vec::new(),
            },
            writer: IpcRequestWriter { inner: write_half },
            timeout,
        }
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request to the daemon and wait for its reply.
    ///
    /// Streamed terminal messages that arrive first are kept for
    /// [`IpcClient::next_event`].
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent, the reply cannot be
    /// read or parsed, or the operation times out.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, async {
            self.writer.send(&request).await?;
            self.reader.read_reply().await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "operation timed out"))?
    }

    /// Waits for the next streamed terminal message.
    ///
    /// Returns `None` once the daemon closed the connection.
    pub async fn next_event(&mut self) -> Result<Option<TerminalMessage>, IpcError> {
        self.reader.next_event().await
    }

    /// Splits the client so output can be read while input is sent.
    pub fn into_split(self) -> (IpcEventReader, IpcRequestWriter) {
        (self.reader, self.writer)
    }

    /// Send a ping request to check if the daemon is responsive.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Get the current status of the daemon.
    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    /// Request the daemon to stop.
    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    /// List all sessions that are not closed.
    pub async fn list_sessions(&mut self) -> Result<Vec<SessionSummary>, IpcError> {
        match self.send(IpcRequest::ListSessions).await? {
            IpcResponse::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    /// Start a new session.
    pub async fn create_session(
        &mut self,
        request: SessionCreate,
    ) -> Result<SessionCreated, IpcError> {
        match self.send(IpcRequest::CreateSession(request)).await? {
            IpcResponse::SessionCreated(created) => Ok(created),
            other => Err(unexpected(other)),
        }
    }

    /// Attach this connection to a session's output.
    ///
    /// Returns the subscriber ID backing the attachment.
    pub async fn attach(&mut self, session_id: &str) -> Result<SubscriberId, IpcError> {
        let request = IpcRequest::AttachSession {
            session_id: session_id.to_string(),
        };
        match self.send(request).await? {
            IpcResponse::Attached { subscriber_id, .. } => Ok(subscriber_id),
            other => Err(unexpected(other)),
        }
    }

    /// Stop receiving a session's output.
    pub async fn detach(&mut self, session_id: &str) -> Result<(), IpcError> {
        let request = IpcRequest::DetachSession {
            session_id: session_id.to_string(),
        };
        match self.send(request).await? {
            IpcResponse::Detached { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Forward input bytes to a session.
    pub async fn send_input(&mut self, session_id: &str, data: &[u8]) -> Result<(), IpcError> {
        let request = IpcRequest::Input(TerminalMessage::input(session_id, data.to_vec()));
        match self.send(request).await? {
            IpcResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Change a session's terminal size.
    pub async fn resize(&mut self, session_id: &str, cols: u16, rows: u16) -> Result<(), IpcError> {
        let request = IpcRequest::ResizeSession {
            session_id: session_id.to_string(),
            cols,
            rows,
        };
        match self.send(request).await? {
            IpcResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Terminate a session, optionally with a specific signal number.
    pub async fn kill_session(
        &mut self,
        session_id: &str,
        signal: Option<i32>,
    ) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::KillSession {
            session_id: session_id.to_string(),
            signal,
        })
        .await
    }
}

/// Turns an error reply into [`IpcError::Remote`] and anything else into
/// [`IpcError::UnexpectedResponse`].
fn unexpected(response: IpcResponse) -> IpcError {
    match response {
        IpcResponse::Error { code, message } => IpcError::Remote { code, message },
        other => IpcError::UnexpectedResponse(format!("{:?}", other)),
    }
}

/// Read half of an [`IpcClient`].
pub struct IpcEventReader {
    inner: BufReader<ReadHalf<UnixStream>>,
    pending: VecDeque<TerminalMessage>,
    /// Partial line kept across cancelled reads.
    line: Vec<u8>,
}

impl IpcEventReader {
    /// Reads the next message of any kind, buffered terminal messages first.
    ///
    /// Returns `None` once the daemon closed the connection.
    pub async fn read_response(&mut self) -> Result<Option<IpcResponse>, IpcError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(IpcResponse::Terminal(message)));
        }
        self.read_line().await
    }

    /// Waits for the next streamed terminal message, skipping replies.
    pub async fn next_event(&mut self) -> Result<Option<TerminalMessage>, IpcError> {
        loop {
            match self.read_response().await? {
                Some(IpcResponse::Terminal(message)) => return Ok(Some(message)),
                Some(other) => tracing::debug!("Skipping reply while waiting for events: {:?}", other),
                None => return Ok(None),
            }
        }
    }

    /// Reads until the next non-streamed response, buffering the rest.
    async fn read_reply(&mut self) -> Result<IpcResponse, IpcError> {
        loop {
            match self.read_line().await? {
                Some(IpcResponse::Terminal(message)) => self.pending.push_back(message),
                Some(response) => return Ok(response),
                None => {
                    return Err(IpcError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "daemon closed connection",
                    )))
                }
            }
        }
    }

    /// Reads one response line. Cancel safe: the only await is `fill_buf`,
    /// and bytes are moved into `self.line` before they are consumed.
    async fn read_line(&mut self) -> Result<Option<IpcResponse>, IpcError> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                self.line.clear();
                return Ok(None);
            }

            let (used, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    self.line.extend_from_slice(&available[..end]);
                    (end + 1, true)
                }
                None => {
                    self.line.extend_from_slice(available);
                    (available.len(), false)
                }
            };
            self.inner.consume(used);

            if complete {
                let line = std::mem::take(&mut self.line);
                if !line.iter().all(u8::is_ascii_whitespace) {
                    return Ok(Some(serde_json::from_slice(&line)?));
                }
            }
        }
    }
}

/// Write half of an [`IpcClient`].
pub struct IpcRequestWriter {
    inner: WriteHalf<UnixStream>,
}

impl IpcRequestWriter {
    /// Sends a request without waiting for the reply.
    pub async fn send(&mut self, request: &IpcRequest) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(request)?;
        json.push('\n');
        self.inner.write_all(json.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

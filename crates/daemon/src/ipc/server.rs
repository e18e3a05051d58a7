//! IPC Server for handling CLI connections via Unix Domain Sockets.
//!
//! The server listens on a Unix socket and accepts connections from CLI clients,
//! allowing them to send commands and receive responses.

use std::io;
use std::path::{Path, PathBuf};

use ptymux_protocol::ErrorCode;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{UnixListener, UnixStream};

use super::messages::{IpcRequest, IpcResponse};

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// This will create the socket file and any necessary parent directories.
    /// If a socket file already exists at the path, it will be removed first.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The parent directories cannot be created
    /// - The existing socket cannot be removed
    /// - The socket cannot be bound
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
                }
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        tracing::debug!("IPC server listening on {:?}", path);

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Returns the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    ///
    /// This method waits until a client connects.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

/// A connection to an IPC client.
///
/// This struct wraps a Unix stream and provides methods for reading
/// requests and sending responses using JSON newline-delimited protocol.
pub struct IpcConnection {
    reader: RequestReader,
    writer: ResponseWriter,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: RequestReader {
                inner: BufReader::new(read_half),
            },
            writer: ResponseWriter { inner: write_half },
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        self.reader.read_request().await
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        self.writer.send_response(response).await
    }

    /// Splits the connection so requests and responses can be handled by
    /// different tasks.
    pub fn into_split(self) -> (RequestReader, ResponseWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of an [`IpcConnection`].
pub struct RequestReader {
    inner: BufReader<ReadHalf<UnixStream>>,
}

impl RequestReader {
    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be read or parsed.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = self.inner.read_line(&mut line).await?;
            if bytes_read == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                break;
            }
        }

        let request = serde_json::from_str(line.trim())?;
        Ok(Some(request))
    }
}

/// Write half of an [`IpcConnection`].
pub struct ResponseWriter {
    inner: WriteHalf<UnixStream>,
}

impl ResponseWriter {
    /// Send a response to the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the response cannot be serialized or sent.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.inner.write_all(json.as_bytes()).await?;
        self.inner.flush().await?;

        Ok(())
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The daemon rejected the request.
    #[error("{message}")]
    Remote {
        /// Error category reported by the daemon.
        code: ErrorCode,
        /// Error message reported by the daemon.
        message: String,
    },

    /// The daemon answered with something other than what the request expects.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

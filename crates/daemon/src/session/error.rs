//! Error types for session operations.

use ptymux_protocol::ErrorCode;
use thiserror::Error;

use super::SessionId;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The process could not be started. Nothing was registered.
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// The session id is unknown or the session has already been removed.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session is closing or closed and no longer accepts the operation.
    #[error("session terminated: {0}")]
    Terminated(SessionId),

    /// Input was submitted after the process channel closed.
    #[error("write after process channel closed")]
    WriteAfterClose,

    /// The process is not draining its input queue.
    #[error("input queue full, process is not reading input")]
    InputBackpressure,

    /// The configured session limit is reached.
    #[error("session limit reached: {0} sessions already running")]
    LimitReached(usize),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    Resize(String),

    /// Failed to deliver a signal to the process.
    #[error("failed to signal process: {0}")]
    Signal(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Maps the error onto the wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::Spawn(_) => ErrorCode::SpawnFailed,
            SessionError::NotFound(_) => ErrorCode::NotFound,
            SessionError::Terminated(_) => ErrorCode::SessionTerminated,
            SessionError::WriteAfterClose => ErrorCode::WriteAfterClose,
            SessionError::InputBackpressure => ErrorCode::Backpressure,
            SessionError::LimitReached(_) => ErrorCode::LimitReached,
            SessionError::Resize(_) | SessionError::Signal(_) | SessionError::Io(_) => {
                ErrorCode::InternalError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SessionError::Spawn("nope".to_string()).code(),
            ErrorCode::SpawnFailed
        );
        assert_eq!(
            SessionError::NotFound("s".to_string()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            SessionError::Terminated("s".to_string()).code(),
            ErrorCode::SessionTerminated
        );
        assert_eq!(SessionError::WriteAfterClose.code(), ErrorCode::WriteAfterClose);
        assert_eq!(SessionError::LimitReached(4).code(), ErrorCode::LimitReached);
        assert_eq!(
            SessionError::Resize("x".to_string()).code(),
            ErrorCode::InternalError
        );
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::LimitReached(10);
        assert_eq!(
            err.to_string(),
            "session limit reached: 10 sessions already running"
        );
    }
}

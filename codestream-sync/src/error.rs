//! Error types for the sync engine.

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the sync engine.
///
/// Transport failures never reach the application while a session is live;
/// the session task recovers from them with reconnect-and-backoff and only
/// logs them. Bootstrap failures are terminal for the session view.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or WebSocket failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The REST request itself failed (connect, timeout, body decode).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The REST collaborator answered with a non-success status.
    #[error("session bootstrap failed with status {status}: {message}")]
    Bootstrap {
        /// HTTP status code.
        status: u16,
        /// Response body, if any.
        message: String,
    },

    /// A configured endpoint is not a valid URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The session task has already shut down.
    #[error("sync session has shut down")]
    SessionClosed,

    /// The session task panicked or was aborted.
    #[error("session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SyncError {
    /// Returns true if the operation can be retried.
    ///
    /// Only transport failures are retryable. Every bootstrap failure,
    /// whether the request never completed or the status was not a
    /// success, leaves no live state to recover and is reported as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

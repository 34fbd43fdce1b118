//! Error types for the replication engine.

use mossdb_repl_protocol::ProtocolError;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Errors that can occur during replication.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplError {
    /// Network or HTTP error.
    #[error("transport error: {message}")]
    Transport {
        /// HTTP status code, when the remote answered at all.
        status: Option<u16>,
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (unparsable or malformed wire body).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Session negotiation or login failed.
    #[error("session error: {0}")]
    Session(String),

    /// The local store reported a failure.
    #[error("local store error: {0}")]
    Store(String),

    /// A document ID failed validation.
    #[error("invalid document ID: {0}")]
    BadDocumentId(String),

    /// Replication was cancelled.
    #[error("replication cancelled")]
    Cancelled,
}

impl ReplError {
    /// Creates a retryable transport error with no HTTP status.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error with no HTTP status.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a transport error from an HTTP status code.
    ///
    /// 5xx responses are retryable; 4xx responses are not. Whether a 404 or
    /// 412 is an error at all depends on the request, so that decision is
    /// left to the caller.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self::Transport {
            status: Some(status),
            message: message.into(),
            retryable: status >= 500,
        }
    }

    /// Returns the HTTP status carried by a transport error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ReplError::Transport { status, .. } => *status,
            _ => None,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplError::Transport { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl From<ProtocolError> for ReplError {
    fn from(err: ProtocolError) -> Self {
        ReplError::Protocol(err.to_string())
    }
}

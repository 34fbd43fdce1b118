//! Error types for the replication protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding wire bodies.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A revision ID did not match the `<generation>-<hash>` form.
    #[error("invalid revision ID: {0}")]
    InvalidRevId(String),

    /// A message was structurally valid JSON but missing required content.
    #[error("invalid message structure: {0}")]
    InvalidStructure(String),
}

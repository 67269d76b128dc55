//! Error types for satlink
//!
//! Two layers: `RpcError` covers the transport channel, `Error` covers everything
//! a command or workflow can fail with.

use thiserror::Error;

/// Errors raised by the transport channel
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("call timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("unknown function: {0}")]
    UnknownMethod(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Whether this is a connection-level failure that the handshake loop
    /// retries after a backoff
    pub fn is_retryable_connect(&self) -> bool {
        matches!(self, RpcError::Connect(_) | RpcError::Closed | RpcError::Io(_))
    }
}

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("subsystem error: {0}")]
    Subsystem(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;

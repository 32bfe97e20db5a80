//! Client error types.

use resplink_protocol::{ErrorReply, ProtocolError};
use std::sync::Arc;
use thiserror::Error;

/// Client errors.
///
/// Errors are `Clone` because a single failure (a dropped connection, a
/// protocol error, an aborted transaction) rejects many pending requests.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("command queue full ({max} pending)")]
    QueueFull { max: usize },

    #[error("server error: {message}")]
    ServerError { code: String, message: String },

    #[error("transaction aborted: a watched key was modified")]
    TransactionAborted,

    #[error("transaction reply mismatch: expected {expected} replies, got {actual}")]
    TransactionMismatch { expected: usize, actual: usize },

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::TransactionAborted => true,
            ClientError::ServerError { code, .. } => {
                matches!(code.as_str(), "LOADING" | "BUSY" | "TRYAGAIN" | "MASTERDOWN")
            }
            _ => false,
        }
    }

    /// Server error code, e.g. `WRONGTYPE`.
    pub fn server_code(&self) -> Option<&str> {
        match self {
            ClientError::ServerError { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}

impl From<ErrorReply> for ClientError {
    fn from(err: ErrorReply) -> Self {
        ClientError::ServerError {
            code: err.code().to_string(),
            message: err.message,
        }
    }
}

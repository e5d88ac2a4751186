use std::time::Duration;

use thiserror::Error;

/// Signaling client errors
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("not connected")]
    NotConnected,

    #[error("transport closed")]
    Closed,

    #[error("invalid message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

//! Error types for the multiplexer.

use thiserror::Error;

/// Main error type for multiplexer operations.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("No endpoint available")]
    NoEndpointAvailable,

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Handler failed on stream {stream}: {message}")]
    HandlerFailure { stream: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid entry id: {0}")]
    InvalidEntryId(String),
}

impl MuxError {
    /// Whether this error means the connection it came from is no longer usable.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, MuxError::Io(_) | MuxError::StoreUnavailable(_))
    }
}

impl From<serde_json::Error> for MuxError {
    fn from(e: serde_json::Error) -> Self {
        MuxError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for MuxError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        MuxError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for MuxError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        MuxError::Deserialization(e.to_string())
    }
}

/// Result type for multiplexer operations.
pub type Result<T> = std::result::Result<T, MuxError>;

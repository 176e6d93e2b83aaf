//! Error types for FluxDM core

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the engine's public API
#[derive(Debug, Error)]
pub enum FluxError {
    #[error("Invalid download spec: {0}")]
    InvalidSpec(#[from] SpecError),

    #[error("Download not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Validation failures, rejected synchronously at `add`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("URL is empty")]
    EmptyUrl,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Destination is not writable: {0}")]
    Destination(String),

    #[error("Invalid option: {0}")]
    InvalidOption(String),
}

/// Failures of the preliminary metadata request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("Source unreachable: {0}")]
    Unreachable(String),

    #[error("Probe timed out")]
    Timeout,

    #[error("Server answered {0}")]
    Non2xxStatus(u16),
}

/// Failures local to one segment. The coordinator decides retry vs terminal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Range mismatch: requested {requested}, server returned {returned}")]
    RangeMismatch { requested: String, returned: String },

    #[error("Server answered {0}")]
    Status(u16),

    #[error("Stream ended early: expected {expected} bytes, got {received}")]
    Incomplete { expected: u64, received: u64 },

    #[error("File write failed: {0}")]
    Io(String),

    #[error("Worker aborted: {0}")]
    Internal(String),
}

impl SegmentError {
    /// Check if this error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SegmentError::Io(_))
    }
}

/// Failures of the persistence gateway. Never fatal to a running download.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt resume token: {0}")]
    Corrupt(String),
}

/// Transport-level failures reported by a [`crate::Transport`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Timed out")]
    Timeout,

    #[error("Body read failed: {0}")]
    Body(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(e.to_string())
        } else {
            TransportError::Connect(e.to_string())
        }
    }
}

impl From<TransportError> for ProbeError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => ProbeError::Timeout,
            other => ProbeError::Unreachable(other.to_string()),
        }
    }
}

impl From<TransportError> for SegmentError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => SegmentError::Timeout,
            TransportError::Connect(msg) | TransportError::Body(msg) => {
                SegmentError::ConnectionReset(msg)
            }
        }
    }
}

//! Error types for jobtrack.

use thiserror::Error;

/// Result type alias using jobtrack's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for jobtrack operations.
///
/// Remote failures are split by how the coordinator reacts to them:
/// [`Error::Request`] is transient and retried on the next tick,
/// [`Error::Serialization`] is a malformed payload (also retried), while
/// [`Error::Unauthorized`] and [`Error::Rejected`] are fatal and stop the class.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP/network request failed (transient)
    #[error("Request error: {0}")]
    Request(String),

    /// Serialization/deserialization error (malformed payload or record)
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Authentication/authorization failed (fatal)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The remote service permanently refused the request (fatal)
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Operation not allowed in the current coordinator phase
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation was cancelled before it could complete
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Persistence adapter failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error must stop the job class instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Unauthorized(_) | Error::Rejected(_))
    }

    /// Whether this error is worth retrying on the next polling tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Request(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

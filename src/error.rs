//! Error types for the tokenwarden library

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    /// The identity was not a string or integer-like value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A scope specification could not be parsed
    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    /// A commit violated a uniqueness constraint or could not be applied
    #[error("Persistence conflict: {0}")]
    PersistenceConflict(String),

    /// The token has already been revoked
    #[error("Token already revoked: {0}")]
    AlreadyRevoked(String),

    /// A token or client lookup missed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cryptography-related errors
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the failed operation can be retried as-is.
    ///
    /// Only commit conflicts qualify: issuance retries with a fresh random
    /// token value.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::PersistenceConflict(_))
    }
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid endpoint URL: {0}")]
    InvalidEndpoint(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("credential issuance failed: {0}")]
    Credential(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

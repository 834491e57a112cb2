//! Signer error types.

use thiserror::Error;

/// Signing operation errors.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("key parsing error: {0}")]
    KeyParsing(String),

    #[error("invalid authorization encoding: {0}")]
    Encoding(String),

    #[error("verification failed")]
    VerificationFailed,

    #[error("invalid signature format: {0}")]
    InvalidSignature(String),

    #[error("authorization expired at {0}")]
    Expired(i64),

    #[error("authorization is for {actual}, expected {expected}")]
    WrongScope { expected: String, actual: String },
}

impl From<SignerError> for keepsake_core::Error {
    fn from(e: SignerError) -> Self {
        keepsake_core::Error::Credential(e.to_string())
    }
}

/// Result type for signing operations.
pub type SignerResult<T> = std::result::Result<T, SignerError>;

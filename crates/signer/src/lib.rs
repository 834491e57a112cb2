//! Reference credential issuer for Keepsake endpoints.
//!
//! This crate provides:
//! - Ed25519 key generation and hex encoding
//! - Signed, time-boxed, action-scoped authorizations
//! - [`LocalKeyIssuer`], a [`keepsake_core::CredentialIssuer`] implementation

pub mod authorization;
pub mod error;
pub mod issuer;
pub mod key;

pub use authorization::SignedAuthorization;
pub use error::{SignerError, SignerResult};
pub use issuer::{DEFAULT_TOKEN_LIFETIME, LocalKeyIssuer};
pub use key::{KeyPair, PublicKey, SecretKey};

//! Core domain types for the keepsake blob replication engine.
//!
//! This crate defines the data model shared by the engine, signer and CLI:
//! - Content hashes and their extraction from blob URLs
//! - Endpoints and the normalized endpoint list
//! - Blob descriptors and per-endpoint outcomes
//! - Authorization tokens and the credential-issuer seam
//! - Configuration

pub mod blob;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod hash;
pub mod token;

pub use blob::{BlobDescriptor, DEFAULT_MIME_TYPE, EndpointOutcome, UploadReceipt, sort_outcomes};
pub use config::{ClientConfig, CoalescingConfig, EngineConfig, RetryConfig, TokenCacheConfig};
pub use endpoint::{Endpoint, EndpointEntry, EndpointList, EndpointSelection, EndpointSet};
pub use error::{Error, Result};
pub use hash::ContentHash;
pub use token::{AuthAction, AuthToken, CredentialIssuer, Identity, IdentityMethod, TokenRequest};

/// Default upload size limit: 200 MiB
pub const DEFAULT_MAX_BLOB_SIZE: u64 = 200 * 1024 * 1024;

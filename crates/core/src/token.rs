//! Authorization tokens and the credential-issuer seam.
//!
//! Tokens are minted by an external issuer and treated as opaque by the engine,
//! except for their expiration which drives cache eviction.

use crate::hash::ContentHash;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Action a token authorizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthAction {
    /// Store a blob (also used for mirroring).
    Upload,
    /// List an identity's blobs.
    List,
    /// Delete a blob.
    Delete,
}

impl AuthAction {
    /// Parse from string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "upload" => Ok(Self::Upload),
            "list" => Ok(Self::List),
            "delete" => Ok(Self::Delete),
            _ => Err(crate::Error::InvalidToken(format!("unknown action: {s}"))),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::List => "list",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for AuthAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How an identity produces signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMethod {
    /// A secret key held in-process.
    LocalKey,
    /// A signer reached over the network.
    RemoteSigner,
    /// A signer provided by the host environment.
    External,
}

impl IdentityMethod {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalKey => "local_key",
            Self::RemoteSigner => "remote_signer",
            Self::External => "external",
        }
    }
}

impl fmt::Display for IdentityMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The identity on whose behalf operations run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Public identifier (hex public key).
    pub pubkey: String,
    /// Signing method.
    pub method: IdentityMethod,
}

impl Identity {
    /// Create an identity.
    pub fn new(pubkey: impl Into<String>, method: IdentityMethod) -> Self {
        Self {
            pubkey: pubkey.into(),
            method,
        }
    }
}

/// A time-boxed, action-scoped authorization credential.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    action: AuthAction,
    content_hash: Option<ContentHash>,
    expires_at: OffsetDateTime,
    payload: String,
}

impl AuthToken {
    /// Wrap an encoded credential.
    pub fn new(
        action: AuthAction,
        content_hash: Option<ContentHash>,
        expires_at: OffsetDateTime,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            action,
            content_hash,
            expires_at,
            payload: payload.into(),
        }
    }

    /// The authorized action.
    pub fn action(&self) -> AuthAction {
        self.action
    }

    /// The content hash the token is bound to, if any.
    pub fn content_hash(&self) -> Option<&ContentHash> {
        self.content_hash.as_ref()
    }

    /// When the issuer says the token stops being valid.
    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    /// The opaque encoded credential, as sent in the `Authorization` header.
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("action", &self.action)
            .field("content_hash", &self.content_hash)
            .field("expires_at", &self.expires_at)
            .field("payload", &"<redacted>")
            .finish()
    }
}

/// What an issuer is asked to sign.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenRequest {
    /// Identity the token is for.
    pub identity: Identity,
    /// Authorized action.
    pub action: AuthAction,
    /// Content hash to bind the token to.
    pub content_hash: Option<ContentHash>,
}

/// External collaborator that mints signed credentials.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Mint a token for `request`.
    async fn issue(&self, request: &TokenRequest) -> crate::Result<AuthToken>;
}

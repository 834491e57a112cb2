//! Signed, time-boxed, action-scoped authorization events.
//!
//! An authorization is serialized as JSON, then base64, and sent by the
//! engine as the `Authorization` header payload. Endpoints verify the
//! signature over [`SignedAuthorization::fingerprint`].

use crate::error::{SignerError, SignerResult};
use crate::key::{KeyPair, PublicKey, decode_hex, encode_hex};
use base64::Engine;
use ed25519_dalek::{Signer as _, Verifier};
use keepsake_core::{AuthAction, ContentHash};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;

/// A signed authorization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedAuthorization {
    /// Random id, so two authorizations with identical scope differ.
    pub id: String,
    /// Hex public key of the signer.
    pub pubkey: String,
    /// What the bearer may do.
    pub action: AuthAction,
    /// The blob the authorization is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds; invalid from this instant on.
    pub expiration: i64,
    /// Hex Ed25519 signature over the fingerprint.
    pub sig: String,
}

impl SignedAuthorization {
    /// Sign a new authorization valid for `lifetime` from `now`.
    pub fn sign(
        keypair: &KeyPair,
        action: AuthAction,
        content_hash: Option<ContentHash>,
        now: OffsetDateTime,
        lifetime: Duration,
    ) -> Self {
        let created_at = now.unix_timestamp();
        let mut auth = Self {
            id: uuid::Uuid::new_v4().to_string(),
            pubkey: keypair.public.to_hex(),
            action,
            content_hash,
            created_at,
            expiration: created_at.saturating_add_unsigned(lifetime.as_secs()),
            sig: String::new(),
        };
        let sig = keypair
            .secret
            .signing_key()
            .sign(auth.fingerprint().as_bytes());
        auth.sig = encode_hex(&sig.to_bytes());
        auth
    }

    /// The signed message. The signature itself is excluded.
    pub fn fingerprint(&self) -> String {
        let hash = self
            .content_hash
            .map(|h| h.to_hex())
            .unwrap_or_default();
        format!(
            "keepsake-auth:1;{};{};{};{};{};{}",
            self.id, self.pubkey, self.action, hash, self.created_at, self.expiration
        )
    }

    /// When the authorization stops being valid.
    pub fn expires_at(&self) -> SignerResult<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.expiration)
            .map_err(|e| SignerError::Encoding(format!("expiration out of range: {e}")))
    }

    /// Encode as base64 JSON.
    pub fn encode(&self) -> SignerResult<String> {
        let json = serde_json::to_vec(self).map_err(|e| SignerError::Encoding(e.to_string()))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    /// Decode from base64 JSON. Does not verify.
    pub fn decode(s: &str) -> SignerResult<Self> {
        let json = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| SignerError::Encoding(format!("invalid base64: {e}")))?;
        serde_json::from_slice(&json).map_err(|e| SignerError::Encoding(e.to_string()))
    }

    /// Check the signature and that the authorization has not expired at `now`.
    pub fn verify(&self, now: OffsetDateTime) -> SignerResult<()> {
        let public = PublicKey::from_hex(&self.pubkey)?;

        let sig_bytes = decode_hex(&self.sig)
            .ok_or_else(|| SignerError::InvalidSignature("invalid hex".to_string()))?;
        let sig_array: [u8; 64] = sig_bytes.try_into().map_err(|bytes: Vec<u8>| {
            SignerError::InvalidSignature(format!("expected 64 bytes, got {}", bytes.len()))
        })?;
        let signature = ed25519_dalek::Signature::from_bytes(&sig_array);

        public
            .verifying_key()
            .verify(self.fingerprint().as_bytes(), &signature)
            .map_err(|_| SignerError::VerificationFailed)?;

        if now.unix_timestamp() >= self.expiration {
            return Err(SignerError::Expired(self.expiration));
        }
        Ok(())
    }

    /// Check that the authorization covers `action` on `content_hash`.
    pub fn check_scope(
        &self,
        action: AuthAction,
        content_hash: Option<&ContentHash>,
    ) -> SignerResult<()> {
        if self.action != action {
            return Err(SignerError::WrongScope {
                expected: action.to_string(),
                actual: self.action.to_string(),
            });
        }
        if let Some(expected) = content_hash
            && self.content_hash.as_ref() != Some(expected)
        {
            return Err(SignerError::WrongScope {
                expected: expected.to_hex(),
                actual: self
                    .content_hash
                    .map(|h| h.to_hex())
                    .unwrap_or_else(|| "any blob".to_string()),
            });
        }
        Ok(())
    }
}

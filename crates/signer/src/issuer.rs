//! A [`CredentialIssuer`] backed by an in-process Ed25519 key.

use crate::authorization::SignedAuthorization;
use crate::error::SignerResult;
use crate::key::KeyPair;
use async_trait::async_trait;
use keepsake_core::{AuthToken, CredentialIssuer, Identity, IdentityMethod, TokenRequest};
use std::time::Duration;
use time::OffsetDateTime;

/// Default authorization lifetime.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

/// Signs authorizations with a local secret key.
pub struct LocalKeyIssuer {
    keypair: KeyPair,
    lifetime: Duration,
}

impl LocalKeyIssuer {
    /// Create an issuer for `keypair`.
    pub fn new(keypair: KeyPair, lifetime: Duration) -> Self {
        Self { keypair, lifetime }
    }

    /// Create an issuer from a hex secret key.
    pub fn from_secret_hex(secret: &str, lifetime: Duration) -> SignerResult<Self> {
        Ok(Self::new(KeyPair::from_secret_hex(secret)?, lifetime))
    }

    /// The identity this issuer signs for.
    pub fn identity(&self) -> Identity {
        Identity::new(self.keypair.public.to_hex(), IdentityMethod::LocalKey)
    }

    /// Sign `request` as of `now`.
    pub fn sign_at(
        &self,
        request: &TokenRequest,
        now: OffsetDateTime,
    ) -> keepsake_core::Result<AuthToken> {
        let own = self.keypair.public.to_hex();
        if request.identity.pubkey != own {
            return Err(keepsake_core::Error::Credential(format!(
                "issuer holds the key for {own}, not {}",
                request.identity.pubkey
            )));
        }

        let auth = SignedAuthorization::sign(
            &self.keypair,
            request.action,
            request.content_hash,
            now,
            self.lifetime,
        );
        tracing::debug!(action = %request.action, id = %auth.id, "Signed authorization");

        Ok(AuthToken::new(
            request.action,
            request.content_hash,
            auth.expires_at()?,
            auth.encode()?,
        ))
    }
}

#[async_trait]
impl CredentialIssuer for LocalKeyIssuer {
    async fn issue(&self, request: &TokenRequest) -> keepsake_core::Result<AuthToken> {
        self.sign_at(request, OffsetDateTime::now_utc())
    }
}

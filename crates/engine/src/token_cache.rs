//! Authorization token cache.
//!
//! One signed credential is reused across every endpoint in a fan-out and
//! across operations until it gets close to expiry. Lookups for different
//! keys never contend; concurrent lookups for the same key wait on a per-key
//! lock so the issuer is asked at most once.

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use dashmap::DashMap;
use keepsake_core::{
    AuthAction, AuthToken, ContentHash, CredentialIssuer, Identity, IdentityMethod, TokenRequest,
};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Cache key: `(action, identity method, identity, content hash or "none")`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TokenCacheKey {
    action: AuthAction,
    method: IdentityMethod,
    pubkey: String,
    content_hash: Option<ContentHash>,
}

impl TokenCacheKey {
    /// Build a key.
    pub fn new(identity: &Identity, action: AuthAction, content_hash: Option<&ContentHash>) -> Self {
        Self {
            action,
            method: identity.method,
            pubkey: identity.pubkey.clone(),
            content_hash: content_hash.copied(),
        }
    }
}

impl std::fmt::Display for TokenCacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hash = self
            .content_hash
            .map(|h| h.to_hex())
            .unwrap_or_else(|| "none".to_string());
        write!(f, "{}:{}:{}:{}", self.action, self.method, self.pubkey, hash)
    }
}

#[derive(Clone)]
struct CachedToken {
    token: AuthToken,
    /// `expires_at - safety_margin`; the token is served only before this.
    cache_expiry: OffsetDateTime,
}

type Slot = Arc<Mutex<Option<CachedToken>>>;

/// Creates and reuses short-lived, action-scoped tokens.
pub struct AuthTokenCache {
    issuer: Arc<dyn CredentialIssuer>,
    clock: Arc<dyn Clock>,
    safety_margin: Duration,
    entries: DashMap<TokenCacheKey, Slot>,
}

impl AuthTokenCache {
    /// Create a cache in front of `issuer`.
    pub fn new(
        issuer: Arc<dyn CredentialIssuer>,
        clock: Arc<dyn Clock>,
        safety_margin: Duration,
    ) -> Self {
        Self {
            issuer,
            clock,
            safety_margin,
            entries: DashMap::new(),
        }
    }

    /// Return a cached token for the key if it is still comfortably valid,
    /// otherwise mint, store and return a new one.
    pub async fn get_or_create(
        &self,
        identity: &Identity,
        action: AuthAction,
        content_hash: Option<&ContentHash>,
    ) -> EngineResult<AuthToken> {
        let key = TokenCacheKey::new(identity, action, content_hash);

        // Clone the slot out so the map shard lock is released before awaiting.
        let slot: Slot = self.entries.entry(key.clone()).or_default().clone();
        let mut guard = slot.lock().await;

        if let Some(cached) = guard.as_ref() {
            if self.clock.now() < cached.cache_expiry {
                tracing::debug!(key = %key, "Token cache hit");
                return Ok(cached.token.clone());
            }
            tracing::debug!(key = %key, "Cached token near expiry, evicting");
            *guard = None;
        }

        let request = TokenRequest {
            identity: identity.clone(),
            action,
            content_hash: content_hash.copied(),
        };
        let token = self
            .issuer
            .issue(&request)
            .await
            .map_err(|e| EngineError::Credential(e.to_string()))?;

        if token.action() != action || token.content_hash() != content_hash {
            return Err(EngineError::Credential(format!(
                "issuer returned a token for {} {:?}, expected {} {:?}",
                token.action(),
                token.content_hash(),
                action,
                content_hash
            )));
        }

        let cache_expiry = token.expires_at() - self.safety_margin;
        tracing::debug!(
            key = %key,
            expires_at = %token.expires_at(),
            "Issued new token"
        );

        *guard = Some(CachedToken {
            token: token.clone(),
            cache_expiry,
        });
        Ok(token)
    }

    /// Remove entries whose cache expiry has passed. Returns how many were removed.
    ///
    /// Lookups re-check expiry themselves; this only bounds memory.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();

        self.entries.retain(|_, slot| {
            // A slot held elsewhere is mid-lookup; leave it alone.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(guard) => guard.as_ref().is_some_and(|cached| now < cached.cache_expiry),
                Err(_) => true,
            }
        });

        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "Swept expired tokens");
        }
        removed
    }

    /// Spawn the periodic sweep. Abort the handle to stop it.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

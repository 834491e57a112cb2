//! Collapses concurrent identical operations into one execution.
//!
//! The first caller for a key becomes the leader and registers a shared
//! future; callers arriving while the entry is younger than the TTL await
//! that same future. The entry is removed as soon as the operation settles
//! (or every caller has gone away), so the next call runs again.

use crate::error::{EngineResult, Operation};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use keepsake_core::{ContentHash, EndpointList, Identity};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio::time::error::Elapsed;

/// Deterministic identity of an operation for coalescing.
///
/// Built from the operation name, the identity and its method, and the
/// endpoint URLs sorted so that rank order does not matter. Hash-bound
/// operations also carry the content hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InFlightKey(String);

impl InFlightKey {
    /// Build a key.
    pub fn new(
        operation: Operation,
        identity: Option<&Identity>,
        endpoints: &EndpointList,
        content_hash: Option<&ContentHash>,
    ) -> Self {
        let (pubkey, method) = match identity {
            Some(identity) => (identity.pubkey.as_str(), identity.method.as_str()),
            None => ("anonymous", "none"),
        };
        let mut key = format!(
            "{operation}|{pubkey}|{method}|{}",
            endpoints.sorted_urls().join(",")
        );
        if let Some(hash) = content_hash {
            key.push('|');
            key.push_str(&hash.to_hex());
        }
        Self(key)
    }

    /// The key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InFlightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type SharedResult<T> = Shared<BoxFuture<'static, EngineResult<T>>>;
type WeakResult<T> = WeakShared<BoxFuture<'static, EngineResult<T>>>;

struct InFlight<T> {
    id: u64,
    started_at: Instant,
    /// `None` only if the future had already completed when registered.
    future: Option<WeakResult<T>>,
}

/// Removes the map entry when the leader's future finishes or is dropped.
struct CleanupGuard<T> {
    entries: Arc<DashMap<InFlightKey, InFlight<T>>>,
    key: InFlightKey,
    id: u64,
}

impl<T> Drop for CleanupGuard<T> {
    fn drop(&mut self) {
        // A newer leader may own the key after a TTL expiry; only remove our own entry.
        self.entries.remove_if(&self.key, |_, entry| entry.id == self.id);
    }
}

/// Per-result-type coalescing map.
pub struct RequestCoalescer<T> {
    entries: Arc<DashMap<InFlightKey, InFlight<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for RequestCoalescer<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty coalescer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` unless an identical one started less than `ttl` ago
    /// is still pending, in which case share its outcome.
    pub async fn dedupe<F, Fut>(&self, key: InFlightKey, operation: F, ttl: Duration) -> EngineResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = EngineResult<T>> + Send + 'static,
    {
        let (shared, _) = self.enter(key, operation, ttl);
        shared.await
    }

    /// [`dedupe`](Self::dedupe) for a caller with its own deadline.
    ///
    /// A leader's `operation` is expected to honour the deadline itself. A
    /// joiner shares someone else's run, so its wait is cut at `deadline`;
    /// the shared run carries on for the callers still waiting.
    pub async fn dedupe_until<F, Fut>(
        &self,
        key: InFlightKey,
        operation: F,
        ttl: Duration,
        deadline: Instant,
    ) -> Result<EngineResult<T>, Elapsed>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = EngineResult<T>> + Send + 'static,
    {
        let (shared, joined) = self.enter(key, operation, ttl);
        if joined {
            tokio::time::timeout_at(deadline, shared).await
        } else {
            Ok(shared.await)
        }
    }

    /// Join a live entry for `key` or register `operation` as the new leader.
    /// Returns the shared future and whether it was joined.
    fn enter<F, Fut>(&self, key: InFlightKey, operation: F, ttl: Duration) -> (SharedResult<T>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = EngineResult<T>> + Send + 'static,
    {
        // The shared handle leaves this fn before the shard lock is released,
        // so a last-reference drop can never re-enter the map under the lock.
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                let live = if existing.started_at.elapsed() < ttl {
                    existing.future.as_ref().and_then(WeakShared::upgrade)
                } else {
                    None
                };
                match live {
                    Some(shared) => {
                        tracing::debug!(key = %key, "Joining in-flight operation");
                        (shared, true)
                    }
                    None => {
                        let (shared, entry) = self.lead(key.clone(), operation);
                        occupied.insert(entry);
                        (shared, false)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let (shared, entry) = self.lead(key.clone(), operation);
                vacant.insert(entry);
                (shared, false)
            }
        }
    }

    fn lead<F, Fut>(&self, key: InFlightKey, operation: F) -> (SharedResult<T>, InFlight<T>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = EngineResult<T>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = CleanupGuard {
            entries: self.entries.clone(),
            key,
            id,
        };

        let shared = async move {
            let _guard = guard;
            operation().await
        }
        .boxed()
        .shared();

        let entry = InFlight {
            id,
            started_at: Instant::now(),
            future: shared.downgrade(),
        };
        (shared, entry)
    }

    /// Number of registered in-flight operations.
    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }
}

//! Multi-endpoint blob operations.
//!
//! Every public operation follows the same shape: validate input, build an
//! [`InFlightKey`], and run the work through that operation's coalescer. The
//! work itself obtains one shared token, fans out to the endpoints (or walks
//! them in rank order), runs each call under the retry policy, and folds
//! per-endpoint results into a report.
//!
//! Per-endpoint failures never escape on their own. They become
//! [`EndpointOutcome`]s; only "every endpoint failed" is an error.

use crate::aggregate::{EndpointListing, ListingReport, ResultAggregator};
use crate::client::{BlobPayload, DeleteStatus, EndpointClient, EndpointResult, HttpEndpointClient};
use crate::clock::{Clock, SystemClock};
use crate::coalescer::{InFlightKey, RequestCoalescer};
use crate::error::{EndpointError, EngineError, EngineResult, ErrorKind, Operation};
use crate::retry::RetryPolicy;
use crate::token_cache::AuthTokenCache;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use keepsake_core::endpoint::origin_of;
use keepsake_core::{
    AuthAction, AuthToken, BlobDescriptor, ContentHash, CredentialIssuer, Endpoint, EndpointList,
    EndpointOutcome, EngineConfig, Identity, UploadReceipt, sort_outcomes,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Per-call options.
#[derive(Clone, Copy, Debug, Default)]
pub struct OperationOptions {
    /// Pending endpoint calls are cancelled at this instant. Calls that
    /// already settled keep their outcome.
    pub deadline: Option<Instant>,
}

impl OperationOptions {
    /// Options with a deadline `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }
}

/// Result of an upload-to-all or mirror.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadReport {
    /// Receipt from the lowest-ranked endpoint that succeeded.
    pub primary: UploadReceipt,
    /// The endpoint that produced `primary`.
    pub primary_endpoint: Endpoint,
    /// The blob with one availability entry per attempted endpoint.
    pub blob: BlobDescriptor,
}

impl UploadReport {
    /// Endpoints that now hold the blob.
    pub fn succeeded(&self) -> usize {
        self.blob.available_on().count()
    }
}

/// Result of an upload-with-fallback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FallbackUpload {
    /// Receipt from the endpoint that accepted the blob.
    pub receipt: UploadReceipt,
    /// The endpoint that accepted it.
    pub endpoint: Endpoint,
    /// Attempts in rank order, ending with the success.
    pub attempts: Vec<EndpointOutcome>,
}

/// Result of a delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteReport {
    /// The deleted blob.
    pub content_hash: ContentHash,
    /// One outcome per endpoint. A 404 counts as success.
    pub outcomes: Vec<EndpointOutcome>,
    /// Endpoints that confirmed deletion.
    pub deleted: usize,
    /// Endpoints that did not have the blob.
    pub absent: usize,
}

/// Result of a mirror.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// At least one target now holds the blob.
    Mirrored(UploadReport),
    /// Every endpoint shares the source's origin; there was nowhere to copy to.
    NothingToMirror,
}

/// Availability of a blob on one endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Availability {
    /// The endpoint has it.
    Available,
    /// The endpoint confirmed it does not have it.
    Unavailable,
    /// No answer either way.
    Error(String),
}

/// One endpoint's probe result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeResult {
    /// Probed endpoint.
    pub endpoint: Endpoint,
    /// What it said.
    pub availability: Availability,
}

/// Result of an availability probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeReport {
    /// The probed blob.
    pub content_hash: ContentHash,
    /// Results sorted by endpoint URL.
    pub results: Vec<ProbeResult>,
}

impl ProbeReport {
    /// Every endpoint cut off by the deadline before answering.
    fn indeterminate(endpoints: &EndpointList, hash: ContentHash) -> Self {
        let mut results: Vec<ProbeResult> = endpoints
            .iter()
            .map(|endpoint| ProbeResult {
                endpoint: endpoint.clone(),
                availability: Availability::Error(EndpointError::deadline_exceeded().to_string()),
            })
            .collect();
        results.sort_by(|a, b| a.endpoint.url().cmp(b.endpoint.url()));
        Self {
            content_hash: hash,
            results,
        }
    }

    /// Endpoints that have the blob.
    pub fn available(&self) -> impl Iterator<Item = &Endpoint> {
        self.with(|a| matches!(a, Availability::Available))
    }

    /// Endpoints that confirmed absence. Only these are safe to repair;
    /// an indeterminate probe says nothing about what the endpoint holds.
    pub fn unavailable(&self) -> impl Iterator<Item = &Endpoint> {
        self.with(|a| matches!(a, Availability::Unavailable))
    }

    fn with(&self, pred: impl Fn(&Availability) -> bool) -> impl Iterator<Item = &Endpoint> {
        self.results
            .iter()
            .filter(move |r| pred(&r.availability))
            .map(|r| &r.endpoint)
    }
}

/// Result of a download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Download {
    /// Verified blob bytes.
    pub bytes: Bytes,
    /// The endpoint that served them.
    pub endpoint: Endpoint,
    /// Attempts in rank order, ending with the success.
    pub attempts: Vec<EndpointOutcome>,
}

/// The multi-endpoint orchestrator.
///
/// Cloning is cheap and clones share the token cache and coalescers.
#[derive(Clone)]
pub struct BlobTransferEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    client: Arc<dyn EndpointClient>,
    tokens: Arc<AuthTokenCache>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    coalesce_ttl: Duration,
    sweep_interval: Duration,
    max_blob_size: u64,
    mirror_upload_fallback: bool,
    uploads: RequestCoalescer<UploadReport>,
    fallback_uploads: RequestCoalescer<FallbackUpload>,
    deletes: RequestCoalescer<DeleteReport>,
    mirrors: RequestCoalescer<MirrorOutcome>,
    listings: RequestCoalescer<ListingReport>,
    probes: RequestCoalescer<ProbeReport>,
    downloads: RequestCoalescer<Download>,
}

impl BlobTransferEngine {
    /// Create an engine with explicit collaborators.
    pub fn new(
        config: &EngineConfig,
        client: Arc<dyn EndpointClient>,
        issuer: Arc<dyn CredentialIssuer>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        config.validate().map_err(EngineError::Configuration)?;

        let tokens = Arc::new(AuthTokenCache::new(
            issuer,
            clock.clone(),
            config.tokens.safety_margin(),
        ));

        Ok(Self {
            inner: Arc::new(EngineInner {
                client,
                tokens,
                clock,
                retry: RetryPolicy::from_config(&config.retry),
                coalesce_ttl: config.coalescing.ttl(),
                sweep_interval: config.tokens.sweep_interval(),
                max_blob_size: config.max_blob_size,
                mirror_upload_fallback: config.mirror_upload_fallback,
                uploads: RequestCoalescer::new(),
                fallback_uploads: RequestCoalescer::new(),
                deletes: RequestCoalescer::new(),
                mirrors: RequestCoalescer::new(),
                listings: RequestCoalescer::new(),
                probes: RequestCoalescer::new(),
                downloads: RequestCoalescer::new(),
            }),
        })
    }

    /// Create an engine speaking HTTP with the system clock.
    pub fn with_http(config: &EngineConfig, issuer: Arc<dyn CredentialIssuer>) -> EngineResult<Self> {
        let client = Arc::new(HttpEndpointClient::new(config)?);
        Self::new(config, client, issuer, Arc::new(SystemClock))
    }

    /// The shared token cache.
    pub fn token_cache(&self) -> &Arc<AuthTokenCache> {
        &self.inner.tokens
    }

    /// Start the periodic token sweep at the configured interval.
    pub fn spawn_token_sweeper(&self) -> JoinHandle<()> {
        self.inner
            .tokens
            .clone()
            .spawn_sweeper(self.inner.sweep_interval)
    }

    fn check_payload(&self, payload: &BlobPayload) -> EngineResult<ContentHash> {
        if payload.len() > self.inner.max_blob_size {
            return Err(EngineError::Validation(format!(
                "blob is {} bytes, limit is {}",
                payload.len(),
                self.inner.max_blob_size
            )));
        }
        Ok(ContentHash::compute(&payload.bytes))
    }

    /// Run `work` through `coalescer`. A caller that joins someone else's run
    /// stops waiting at its own deadline and gets `expired()` instead.
    async fn coalesced<T, F, Fut, X>(
        &self,
        coalescer: &RequestCoalescer<T>,
        key: InFlightKey,
        deadline: Option<Instant>,
        work: F,
        expired: X,
    ) -> EngineResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = EngineResult<T>> + Send + 'static,
        X: FnOnce() -> EngineResult<T>,
    {
        let ttl = self.inner.coalesce_ttl;
        let Some(deadline) = deadline else {
            return coalescer.dedupe(key, work, ttl).await;
        };
        match coalescer.dedupe_until(key.clone(), work, ttl, deadline).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(key = %key, "Deadline reached while waiting on a shared operation");
                expired()
            }
        }
    }

    /// Upload to every endpoint concurrently.
    ///
    /// Succeeds if at least one endpoint stored the blob.
    pub async fn upload(
        &self,
        identity: &Identity,
        endpoints: &EndpointList,
        payload: BlobPayload,
        options: OperationOptions,
    ) -> EngineResult<UploadReport> {
        let hash = self.check_payload(&payload)?;
        let key = InFlightKey::new(Operation::Upload, Some(identity), endpoints, Some(&hash));
        let inner = self.inner.clone();
        let (owner, targets) = (identity.clone(), endpoints.clone());

        self.coalesced(
            &self.inner.uploads,
            key,
            options.deadline,
            move || async move {
                inner
                    .upload_to_all(&owner, &targets, &payload, hash, options.deadline)
                    .await
            },
            || Err(deadline_failure(Operation::Upload, endpoints)),
        )
        .await
    }

    /// Upload to the first endpoint, in rank order, that accepts the blob.
    pub async fn upload_with_fallback(
        &self,
        identity: &Identity,
        endpoints: &EndpointList,
        payload: BlobPayload,
        options: OperationOptions,
    ) -> EngineResult<FallbackUpload> {
        let hash = self.check_payload(&payload)?;
        let key = InFlightKey::new(
            Operation::UploadFallback,
            Some(identity),
            endpoints,
            Some(&hash),
        );
        let inner = self.inner.clone();
        let (owner, targets) = (identity.clone(), endpoints.clone());

        self.coalesced(
            &self.inner.fallback_uploads,
            key,
            options.deadline,
            move || async move {
                inner
                    .upload_in_order(&owner, &targets, &payload, hash, options.deadline)
                    .await
            },
            || Err(deadline_failure(Operation::UploadFallback, endpoints)),
        )
        .await
    }

    /// Delete from every endpoint.
    pub async fn delete(
        &self,
        identity: &Identity,
        endpoints: &EndpointList,
        hash: ContentHash,
        options: OperationOptions,
    ) -> EngineResult<DeleteReport> {
        let key = InFlightKey::new(Operation::Delete, Some(identity), endpoints, Some(&hash));
        let inner = self.inner.clone();
        let (owner, targets) = (identity.clone(), endpoints.clone());

        self.coalesced(
            &self.inner.deletes,
            key,
            options.deadline,
            move || async move {
                inner
                    .delete_everywhere(&owner, &targets, hash, options.deadline)
                    .await
            },
            || Err(deadline_failure(Operation::Delete, endpoints)),
        )
        .await
    }

    /// Copy the blob at `source_url` to every endpoint not sharing its origin.
    pub async fn mirror(
        &self,
        identity: &Identity,
        endpoints: &EndpointList,
        source_url: &str,
        options: OperationOptions,
    ) -> EngineResult<MirrorOutcome> {
        let hash = ContentHash::extract_from_url(source_url).ok_or_else(|| {
            EngineError::Validation(format!("no content hash in source URL: {source_url}"))
        })?;
        let source_origin = origin_of(source_url)
            .ok_or_else(|| EngineError::Validation(format!("invalid source URL: {source_url}")))?;

        let Some(targets) = endpoints.excluding_origin(&source_origin) else {
            tracing::info!(source = %source_url, "Every endpoint is the mirror source, nothing to do");
            return Ok(MirrorOutcome::NothingToMirror);
        };

        let key = InFlightKey::new(Operation::Mirror, Some(identity), &targets, Some(&hash));
        let inner = self.inner.clone();
        let owner = identity.clone();
        let source = source_url.to_string();
        let shared_targets = targets.clone();

        self.coalesced(
            &self.inner.mirrors,
            key,
            options.deadline,
            move || async move {
                inner
                    .mirror_to_all(&owner, &shared_targets, &source, hash, options.deadline)
                    .await
            },
            || Err(deadline_failure(Operation::Mirror, &targets)),
        )
        .await
    }

    /// List an identity's blobs on every endpoint and merge the results.
    pub async fn list(
        &self,
        identity: &Identity,
        endpoints: &EndpointList,
        options: OperationOptions,
    ) -> EngineResult<ListingReport> {
        let key = InFlightKey::new(Operation::List, Some(identity), endpoints, None);
        let inner = self.inner.clone();
        let (owner, targets) = (identity.clone(), endpoints.clone());

        self.coalesced(
            &self.inner.listings,
            key,
            options.deadline,
            move || async move {
                inner
                    .list_everywhere(&owner, &targets, options.deadline)
                    .await
            },
            || Err(deadline_failure(Operation::List, endpoints)),
        )
        .await
    }

    /// Ask every endpoint whether it has the blob. Needs no credentials and
    /// never fails as a whole; indeterminate answers are reported as such.
    pub async fn probe(
        &self,
        endpoints: &EndpointList,
        hash: ContentHash,
        options: OperationOptions,
    ) -> EngineResult<ProbeReport> {
        let key = InFlightKey::new(Operation::Probe, None, endpoints, Some(&hash));
        let inner = self.inner.clone();
        let targets = endpoints.clone();

        self.coalesced(
            &self.inner.probes,
            key,
            options.deadline,
            move || async move { Ok(inner.probe_everywhere(&targets, hash, options.deadline).await) },
            || Ok(ProbeReport::indeterminate(endpoints, hash)),
        )
        .await
    }

    /// Download from the first endpoint, in rank order, that serves bytes
    /// matching `hash`.
    pub async fn download(
        &self,
        endpoints: &EndpointList,
        hash: ContentHash,
        options: OperationOptions,
    ) -> EngineResult<Download> {
        let key = InFlightKey::new(Operation::Download, None, endpoints, Some(&hash));
        let inner = self.inner.clone();
        let targets = endpoints.clone();

        self.coalesced(
            &self.inner.downloads,
            key,
            options.deadline,
            move || async move {
                inner
                    .download_in_order(&targets, hash, options.deadline)
                    .await
            },
            || Err(deadline_failure(Operation::Download, endpoints)),
        )
        .await
    }

    /// Probe, then mirror from the best available endpoint to the endpoints
    /// that confirmed absence. Endpoints with indeterminate probes are left
    /// alone.
    pub async fn repair(
        &self,
        identity: &Identity,
        endpoints: &EndpointList,
        hash: ContentHash,
        options: OperationOptions,
    ) -> EngineResult<MirrorOutcome> {
        let report = self.probe(endpoints, hash, options).await?;

        // Rank order decides the source, not URL order.
        let Some(source) = endpoints
            .iter()
            .find(|e| report.available().any(|a| a.url() == e.url()))
        else {
            return Err(EngineError::Endpoint(EndpointError::new(
                ErrorKind::NotFound,
                format!("{hash} is not available on any endpoint"),
            )));
        };

        let missing: Vec<&str> = report.unavailable().map(Endpoint::url).collect();
        let Some(targets) = endpoints.filtered(|e| missing.contains(&e.url())) else {
            tracing::info!(hash = %hash, "No endpoint is missing the blob");
            return Ok(MirrorOutcome::NothingToMirror);
        };

        let source_url = format!("{}/{}", source.url(), hash);
        self.mirror(identity, &targets, &source_url, options).await
    }
}

/// Per-endpoint results folded into outcomes.
struct Settled<T> {
    /// Successes in rank order.
    successes: Vec<(Endpoint, T)>,
    /// One outcome per endpoint, sorted by URL.
    outcomes: Vec<EndpointOutcome>,
    /// Failure of the last failing endpoint in rank order.
    last_error: Option<EndpointError>,
}

impl<T> Settled<T> {
    fn from_results(operation: Operation, results: Vec<(Endpoint, EndpointResult<T>)>) -> Self {
        let mut successes = Vec::new();
        let mut outcomes = Vec::with_capacity(results.len());
        let mut last_error = None;

        for (endpoint, result) in results {
            match result {
                Ok(value) => {
                    tracing::debug!(operation = %operation, endpoint = %endpoint, "Endpoint succeeded");
                    outcomes.push(EndpointOutcome::success(endpoint.clone()));
                    successes.push((endpoint, value));
                }
                Err(e) => {
                    tracing::warn!(operation = %operation, endpoint = %endpoint, error = %e, "Endpoint failed");
                    outcomes.push(EndpointOutcome::failure(endpoint, e.to_string()));
                    last_error = Some(e);
                }
            }
        }
        sort_outcomes(&mut outcomes);

        Self {
            successes,
            outcomes,
            last_error,
        }
    }

    fn into_error(self, operation: Operation) -> EngineError {
        all_failed(operation, self.outcomes, self.last_error)
    }
}

fn all_failed(
    operation: Operation,
    attempts: Vec<EndpointOutcome>,
    last_error: Option<EndpointError>,
) -> EngineError {
    EngineError::AllEndpointsFailed {
        operation,
        attempts,
        last_error: last_error.unwrap_or_else(|| EndpointError::network("no endpoint was attempted")),
    }
}

/// Failure for a caller whose deadline passed while it waited on a shared run.
fn deadline_failure(operation: Operation, endpoints: &EndpointList) -> EngineError {
    let error = EndpointError::deadline_exceeded();
    let attempts = endpoints
        .iter()
        .map(|endpoint| EndpointOutcome::failure(endpoint.clone(), error.to_string()))
        .collect();
    all_failed(operation, attempts, Some(error))
}

/// Sequential attempts.
struct InOrder<T> {
    winner: Option<(Endpoint, T)>,
    /// Attempts in rank order; endpoints never tried are absent.
    attempts: Vec<EndpointOutcome>,
    last_error: Option<EndpointError>,
}

/// Run `call` against every endpoint concurrently. Results come back in rank
/// order; endpoints still pending at the deadline are cancelled and reported
/// as network failures.
async fn fan_out<T, F, Fut>(
    endpoints: &EndpointList,
    deadline: Option<Instant>,
    call: F,
) -> Vec<(Endpoint, EndpointResult<T>)>
where
    F: Fn(Endpoint) -> Fut,
    Fut: Future<Output = EndpointResult<T>>,
{
    let mut pending: FuturesUnordered<_> = endpoints
        .iter()
        .cloned()
        .enumerate()
        .map(|(rank, endpoint)| {
            let attempt = call(endpoint);
            async move { (rank, attempt.await) }
        })
        .collect();
    let mut settled: Vec<Option<EndpointResult<T>>> =
        std::iter::repeat_with(|| None).take(endpoints.len()).collect();

    loop {
        let next = match deadline {
            Some(deadline) => {
                let step = tokio::time::timeout_at(deadline, pending.next()).await;
                match step {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::warn!(pending = pending.len(), "Deadline reached, cancelling pending calls");
                        break;
                    }
                }
            }
            None => pending.next().await,
        };
        match next {
            Some((rank, result)) => settled[rank] = Some(result),
            None => break,
        }
    }
    drop(pending);

    endpoints
        .iter()
        .cloned()
        .zip(settled)
        .map(|(endpoint, result)| {
            let result = result.unwrap_or_else(|| Err(EndpointError::deadline_exceeded()));
            (endpoint, result)
        })
        .collect()
}

/// Try endpoints one at a time in rank order until one succeeds.
async fn in_rank_order<T, F, Fut>(
    operation: Operation,
    endpoints: &EndpointList,
    deadline: Option<Instant>,
    call: F,
) -> InOrder<T>
where
    F: Fn(Endpoint) -> Fut,
    Fut: Future<Output = EndpointResult<T>>,
{
    let mut attempts = Vec::new();
    let mut last_error = None;

    for endpoint in endpoints {
        let attempt = call(endpoint.clone());
        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, attempt)
                .await
                .unwrap_or_else(|_| Err(EndpointError::deadline_exceeded())),
            None => attempt.await,
        };

        match result {
            Ok(value) => {
                tracing::debug!(operation = %operation, endpoint = %endpoint, "Endpoint succeeded");
                attempts.push(EndpointOutcome::success(endpoint.clone()));
                return InOrder {
                    winner: Some((endpoint.clone(), value)),
                    attempts,
                    last_error,
                };
            }
            Err(e) => {
                tracing::warn!(operation = %operation, endpoint = %endpoint, error = %e, "Endpoint failed");
                attempts.push(EndpointOutcome::failure(endpoint.clone(), e.to_string()));
                let cut_off = deadline.is_some_and(|d| Instant::now() >= d);
                last_error = Some(e);
                if cut_off {
                    break;
                }
            }
        }
    }

    InOrder {
        winner: None,
        attempts,
        last_error,
    }
}

fn check_receipt(receipt: UploadReceipt, expected: &ContentHash) -> EndpointResult<UploadReceipt> {
    if receipt.content_hash != *expected {
        return Err(EndpointError::validation(format!(
            "endpoint stored {} instead of {expected}",
            receipt.content_hash
        )));
    }
    Ok(receipt)
}

/// What the engine knows about a blob before any endpoint answers.
struct BlobMeta {
    size: u64,
    mime_type: String,
    filename: Option<String>,
}

impl BlobMeta {
    fn of(payload: &BlobPayload) -> Self {
        Self {
            size: payload.len(),
            mime_type: payload.content_type.clone(),
            filename: payload.filename.clone(),
        }
    }
}

impl EngineInner {
    /// Applied to every received body before it is hashed.
    fn check_size(&self, size: u64) -> EndpointResult<()> {
        if size > self.max_blob_size {
            return Err(EndpointError::validation(format!(
                "blob is {size} bytes, limit is {}",
                self.max_blob_size
            )));
        }
        Ok(())
    }

    async fn upload_one(
        &self,
        endpoint: &Endpoint,
        token: &AuthToken,
        payload: &BlobPayload,
        hash: &ContentHash,
    ) -> EndpointResult<UploadReceipt> {
        let outcome = self
            .retry
            .run(|| self.client.upload(endpoint, token, payload))
            .await;
        tracing::debug!(endpoint = %endpoint, attempts = outcome.attempts, "Upload settled");
        check_receipt(outcome.into_result()?, hash)
    }

    fn upload_report(
        &self,
        operation: Operation,
        hash: ContentHash,
        meta: BlobMeta,
        results: Vec<(Endpoint, EndpointResult<UploadReceipt>)>,
    ) -> EngineResult<UploadReport> {
        let settled = Settled::from_results(operation, results);
        let Some((primary_endpoint, primary)) = settled.successes.first().cloned() else {
            return Err(settled.into_error(operation));
        };

        let size = if primary.size > 0 { primary.size } else { meta.size };
        let mime_type = primary.mime_type.clone().unwrap_or(meta.mime_type);
        let blob = BlobDescriptor {
            content_hash: hash,
            size,
            mime_type,
            created_at: self.clock.now(),
            filename: meta.filename,
            availability: settled.outcomes,
        };

        tracing::info!(
            operation = %operation,
            hash = %hash,
            succeeded = settled.successes.len(),
            attempted = blob.availability.len(),
            "Blob stored"
        );
        Ok(UploadReport {
            primary,
            primary_endpoint,
            blob,
        })
    }

    async fn upload_to_all(
        &self,
        identity: &Identity,
        endpoints: &EndpointList,
        payload: &BlobPayload,
        hash: ContentHash,
        deadline: Option<Instant>,
    ) -> EngineResult<UploadReport> {
        let token = self
            .tokens
            .get_or_create(identity, AuthAction::Upload, Some(&hash))
            .await?;
        let token = &token;

        let results = fan_out(endpoints, deadline, move |endpoint| async move {
            self.upload_one(&endpoint, token, payload, &hash).await
        })
        .await;

        self.upload_report(Operation::Upload, hash, BlobMeta::of(payload), results)
    }

    async fn upload_in_order(
        &self,
        identity: &Identity,
        endpoints: &EndpointList,
        payload: &BlobPayload,
        hash: ContentHash,
        deadline: Option<Instant>,
    ) -> EngineResult<FallbackUpload> {
        let token = self
            .tokens
            .get_or_create(identity, AuthAction::Upload, Some(&hash))
            .await?;
        let token = &token;

        let run = in_rank_order(Operation::UploadFallback, endpoints, deadline, move |endpoint| async move {
            self.upload_one(&endpoint, token, payload, &hash).await
        })
        .await;

        match run.winner {
            Some((endpoint, receipt)) => {
                tracing::info!(hash = %hash, endpoint = %endpoint, tried = run.attempts.len(), "Blob stored");
                Ok(FallbackUpload {
                    receipt,
                    endpoint,
                    attempts: run.attempts,
                })
            }
            None => Err(all_failed(Operation::UploadFallback, run.attempts, run.last_error)),
        }
    }

    async fn delete_everywhere(
        &self,
        identity: &Identity,
        endpoints: &EndpointList,
        hash: ContentHash,
        deadline: Option<Instant>,
    ) -> EngineResult<DeleteReport> {
        let token = self
            .tokens
            .get_or_create(identity, AuthAction::Delete, Some(&hash))
            .await?;
        let token = &token;

        let results = fan_out(endpoints, deadline, move |endpoint| async move {
            self.retry
                .run(|| self.client.delete(&endpoint, token, &hash))
                .await
                .into_result()
        })
        .await;

        let settled = Settled::from_results(Operation::Delete, results);
        let deleted = settled
            .successes
            .iter()
            .filter(|(_, status)| *status == DeleteStatus::Deleted)
            .count();
        let absent = settled.successes.len() - deleted;

        // Nothing confirmed and something other than a 404 went wrong.
        if deleted == 0 && settled.last_error.is_some() {
            return Err(settled.into_error(Operation::Delete));
        }

        tracing::info!(hash = %hash, deleted, absent, "Blob deleted");
        Ok(DeleteReport {
            content_hash: hash,
            outcomes: settled.outcomes,
            deleted,
            absent,
        })
    }

    async fn mirror_one(
        &self,
        endpoint: &Endpoint,
        token: &AuthToken,
        source_url: &str,
        source: &OnceCell<EndpointResult<BlobPayload>>,
        hash: &ContentHash,
    ) -> EndpointResult<UploadReceipt> {
        let outcome = self
            .retry
            .run(|| self.client.mirror(endpoint, token, source_url))
            .await;

        match outcome.into_result() {
            Ok(receipt) => check_receipt(receipt, hash),
            Err(e)
                if self.mirror_upload_fallback
                    && matches!(e.kind, ErrorKind::NotFound | ErrorKind::Unsupported) =>
            {
                tracing::debug!(endpoint = %endpoint, error = %e, "No mirror route, uploading source bytes");
                let payload = source
                    .get_or_init(|| self.fetch_source(source_url, hash))
                    .await
                    .clone()?;
                self.upload_one(endpoint, token, &payload, hash).await
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch and verify the mirror source. Runs at most once per mirror.
    async fn fetch_source(&self, source_url: &str, hash: &ContentHash) -> EndpointResult<BlobPayload> {
        let payload = self
            .retry
            .run(|| self.client.fetch(source_url))
            .await
            .into_result()?;
        self.check_size(payload.len())
            .map_err(|e| EndpointError::validation(format!("mirror source {source_url}: {}", e.message)))?;
        hash.verify(&payload.bytes)
            .map_err(|e| EndpointError::validation(format!("mirror source {source_url}: {e}")))?;
        Ok(payload)
    }

    async fn mirror_to_all(
        &self,
        identity: &Identity,
        targets: &EndpointList,
        source_url: &str,
        hash: ContentHash,
        deadline: Option<Instant>,
    ) -> EngineResult<MirrorOutcome> {
        let token = self
            .tokens
            .get_or_create(identity, AuthAction::Upload, Some(&hash))
            .await?;
        let token = &token;
        let source = OnceCell::new();
        let source = &source;

        let results = fan_out(targets, deadline, move |endpoint| async move {
            self.mirror_one(&endpoint, token, source_url, source, &hash)
                .await
        })
        .await;

        let meta = match source.get() {
            Some(Ok(payload)) => BlobMeta::of(payload),
            _ => BlobMeta {
                size: 0,
                mime_type: keepsake_core::DEFAULT_MIME_TYPE.to_string(),
                filename: None,
            },
        };
        self.upload_report(Operation::Mirror, hash, meta, results)
            .map(MirrorOutcome::Mirrored)
    }

    async fn list_everywhere(
        &self,
        identity: &Identity,
        endpoints: &EndpointList,
        deadline: Option<Instant>,
    ) -> EngineResult<ListingReport> {
        let token = self
            .tokens
            .get_or_create(identity, AuthAction::List, None)
            .await?;
        let token = &token;

        let results = fan_out(endpoints, deadline, move |endpoint| async move {
            self.retry
                .run(|| self.client.list(&endpoint, token, identity))
                .await
                .into_result()
        })
        .await;

        if results.iter().all(|(_, result)| result.is_err()) {
            let settled = Settled::from_results(Operation::List, results);
            return Err(settled.into_error(Operation::List));
        }

        let report = ResultAggregator::merge(
            results
                .into_iter()
                .map(|(endpoint, result)| EndpointListing { endpoint, result }),
        );
        tracing::info!(
            blobs = report.blobs.len(),
            failed_endpoints = report.failures.len(),
            "Listing merged"
        );
        Ok(report)
    }

    async fn probe_everywhere(
        &self,
        endpoints: &EndpointList,
        hash: ContentHash,
        deadline: Option<Instant>,
    ) -> ProbeReport {
        let results = fan_out(endpoints, deadline, move |endpoint| async move {
            self.retry
                .run(|| self.client.probe(&endpoint, &hash))
                .await
                .into_result()
        })
        .await;

        let mut results: Vec<ProbeResult> = results
            .into_iter()
            .map(|(endpoint, result)| {
                let availability = match result {
                    Ok(true) => Availability::Available,
                    Ok(false) => Availability::Unavailable,
                    Err(e) => {
                        tracing::warn!(endpoint = %endpoint, error = %e, "Probe indeterminate");
                        Availability::Error(e.to_string())
                    }
                };
                ProbeResult {
                    endpoint,
                    availability,
                }
            })
            .collect();
        results.sort_by(|a, b| a.endpoint.url().cmp(b.endpoint.url()));

        ProbeReport {
            content_hash: hash,
            results,
        }
    }

    async fn download_in_order(
        &self,
        endpoints: &EndpointList,
        hash: ContentHash,
        deadline: Option<Instant>,
    ) -> EngineResult<Download> {
        let run = in_rank_order(Operation::Download, endpoints, deadline, move |endpoint| async move {
            let bytes = self
                .retry
                .run(|| self.client.download(&endpoint, &hash))
                .await
                .into_result()?;
            self.check_size(bytes.len() as u64)?;
            hash.verify(&bytes)
                .map_err(|e| EndpointError::validation(e.to_string()))?;
            Ok::<_, EndpointError>(bytes)
        })
        .await;

        match run.winner {
            Some((endpoint, bytes)) => Ok(Download {
                bytes,
                endpoint,
                attempts: run.attempts,
            }),
            None => Err(all_failed(Operation::Download, run.attempts, run.last_error)),
        }
    }
}

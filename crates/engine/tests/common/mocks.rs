use async_trait::async_trait;
use bytes::Bytes;
use keepsake_core::{
    AuthAction, AuthToken, BlobDescriptor, ContentHash, CredentialIssuer, Endpoint, Identity,
    TokenRequest, UploadReceipt,
};
use keepsake_engine::{BlobPayload, Clock, DeleteStatus, EndpointClient, EndpointError, EndpointResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::time::Duration;

/// One recorded call against the scripted client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub url: String,
}

#[derive(Default)]
struct EndpointScript {
    /// Consumed one per call before any other failure applies.
    transient: VecDeque<EndpointError>,
    always_fail: Option<EndpointError>,
    hang: bool,
    delay: Option<Duration>,
    no_mirror_route: bool,
    corrupt_downloads: bool,
    blobs: HashMap<ContentHash, StoredBlob>,
}

#[derive(Clone)]
struct StoredBlob {
    bytes: Bytes,
    content_type: String,
    uploaded: OffsetDateTime,
}

/// In-memory endpoint fleet with per-endpoint scripted failures.
///
/// Endpoints are keyed by normalized URL and spring into existence on first
/// use, empty and healthy.
#[allow(dead_code)]
#[derive(Default)]
pub struct ScriptedClient {
    endpoints: Mutex<HashMap<String, EndpointScript>>,
    calls: Mutex<Vec<Call>>,
    fetches: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script<R>(&self, url: &str, f: impl FnOnce(&mut EndpointScript) -> R) -> R {
        let mut endpoints = self.endpoints.lock().unwrap();
        f(endpoints.entry(url.to_string()).or_default())
    }

    /// Every call to `url` fails with `error`.
    pub fn fail(&self, url: &str, error: EndpointError) {
        self.script(url, |s| s.always_fail = Some(error));
    }

    /// The next `times` calls to `url` fail with `error`.
    pub fn fail_times(&self, url: &str, times: usize, error: EndpointError) {
        self.script(url, |s| s.transient.extend(std::iter::repeat_n(error, times)));
    }

    /// Calls to `url` never complete.
    pub fn hang(&self, url: &str) {
        self.script(url, |s| s.hang = true);
    }

    /// Calls to `url` take `delay` before answering.
    pub fn delay(&self, url: &str, delay: Duration) {
        self.script(url, |s| s.delay = Some(delay));
    }

    /// `url` answers the mirror route with 404.
    pub fn without_mirror_route(&self, url: &str) {
        self.script(url, |s| s.no_mirror_route = true);
    }

    /// `url` serves bytes that do not match the requested hash.
    pub fn corrupt_downloads(&self, url: &str) {
        self.script(url, |s| s.corrupt_downloads = true);
    }

    /// Place a blob on `url` directly.
    pub fn seed(&self, url: &str, data: &[u8], content_type: &str, uploaded: i64) -> ContentHash {
        let hash = ContentHash::compute(data);
        let blob = StoredBlob {
            bytes: Bytes::copy_from_slice(data),
            content_type: content_type.to_string(),
            uploaded: OffsetDateTime::from_unix_timestamp(uploaded).unwrap(),
        };
        self.script(url, |s| s.blobs.insert(hash, blob));
        hash
    }

    pub fn holds(&self, url: &str, hash: &ContentHash) -> bool {
        self.script(url, |s| s.blobs.contains_key(hash))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// URLs hit by `op`, in call order.
    pub fn calls_to(&self, op: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.op == op)
            .map(|call| call.url)
            .collect()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Record the call and apply the endpoint's script.
    async fn gate(&self, op: &'static str, url: &str) -> EndpointResult<()> {
        self.calls.lock().unwrap().push(Call {
            op,
            url: url.to_string(),
        });
        let (hang, delay, failure) = self.script(url, |s| {
            let failure = s.transient.pop_front().or_else(|| s.always_fail.clone());
            (s.hang, s.delay, failure)
        });

        if hang {
            futures::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn store(&self, url: &str, payload: &BlobPayload) -> UploadReceipt {
        let hash = ContentHash::compute(&payload.bytes);
        let blob = StoredBlob {
            bytes: payload.bytes.clone(),
            content_type: payload.content_type.clone(),
            uploaded: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        };
        self.script(url, |s| s.blobs.insert(hash, blob));

        UploadReceipt {
            content_hash: hash,
            size: payload.len(),
            mime_type: Some(payload.content_type.clone()),
            url: format!("{url}/{hash}"),
        }
    }

    /// Resolve a blob URL against the fleet.
    fn resolve(&self, source_url: &str) -> Option<BlobPayload> {
        let hash = ContentHash::extract_from_url(source_url)?;
        let endpoints = self.endpoints.lock().unwrap();
        endpoints
            .iter()
            .find(|(url, _)| source_url.starts_with(url.as_str()))
            .and_then(|(_, script)| script.blobs.get(&hash))
            .map(|blob| BlobPayload::new(blob.bytes.clone(), Some(&blob.content_type)))
    }
}

#[async_trait]
impl EndpointClient for ScriptedClient {
    async fn upload(
        &self,
        endpoint: &Endpoint,
        token: &AuthToken,
        payload: &BlobPayload,
    ) -> EndpointResult<UploadReceipt> {
        self.gate("upload", endpoint.url()).await?;
        assert_eq!(token.action(), AuthAction::Upload);
        Ok(self.store(endpoint.url(), payload))
    }

    async fn list(
        &self,
        endpoint: &Endpoint,
        token: &AuthToken,
        _identity: &Identity,
    ) -> EndpointResult<Vec<BlobDescriptor>> {
        self.gate("list", endpoint.url()).await?;
        assert_eq!(token.action(), AuthAction::List);
        let blobs = self.script(endpoint.url(), |s| {
            s.blobs
                .iter()
                .map(|(hash, blob)| BlobDescriptor {
                    content_hash: *hash,
                    size: blob.bytes.len() as u64,
                    mime_type: blob.content_type.clone(),
                    created_at: blob.uploaded,
                    filename: None,
                    availability: Vec::new(),
                })
                .collect()
        });
        Ok(blobs)
    }

    async fn delete(
        &self,
        endpoint: &Endpoint,
        token: &AuthToken,
        hash: &ContentHash,
    ) -> EndpointResult<DeleteStatus> {
        self.gate("delete", endpoint.url()).await?;
        assert_eq!(token.action(), AuthAction::Delete);
        let removed = self.script(endpoint.url(), |s| s.blobs.remove(hash).is_some());
        Ok(if removed {
            DeleteStatus::Deleted
        } else {
            DeleteStatus::NotFound
        })
    }

    async fn mirror(
        &self,
        endpoint: &Endpoint,
        token: &AuthToken,
        source_url: &str,
    ) -> EndpointResult<UploadReceipt> {
        self.gate("mirror", endpoint.url()).await?;
        assert_eq!(token.action(), AuthAction::Upload);
        if self.script(endpoint.url(), |s| s.no_mirror_route) {
            return Err(EndpointError::from_status(404, "Not Found"));
        }
        let payload = self
            .resolve(source_url)
            .ok_or_else(|| EndpointError::from_status(502, "source unreachable"))?;
        Ok(self.store(endpoint.url(), &payload))
    }

    async fn probe(&self, endpoint: &Endpoint, hash: &ContentHash) -> EndpointResult<bool> {
        self.gate("probe", endpoint.url()).await?;
        Ok(self.holds(endpoint.url(), hash))
    }

    async fn download(&self, endpoint: &Endpoint, hash: &ContentHash) -> EndpointResult<Bytes> {
        self.gate("download", endpoint.url()).await?;
        let (blob, corrupt) = self.script(endpoint.url(), |s| {
            (s.blobs.get(hash).map(|b| b.bytes.clone()), s.corrupt_downloads)
        });
        match blob {
            Some(_) if corrupt => Ok(Bytes::from_static(b"not what you asked for")),
            Some(bytes) => Ok(bytes),
            None => Err(EndpointError::from_status(404, "Not Found")),
        }
    }

    async fn fetch(&self, url: &str) -> EndpointResult<BlobPayload> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.resolve(url)
            .ok_or_else(|| EndpointError::from_status(404, "Not Found"))
    }
}

/// Issuer that counts how many tokens it mints.
#[allow(dead_code)]
pub struct CountingIssuer {
    clock: Arc<dyn Clock>,
    lifetime: Duration,
    issued: AtomicUsize,
    requests: Mutex<Vec<TokenRequest>>,
}

#[allow(dead_code)]
impl CountingIssuer {
    pub fn new(clock: Arc<dyn Clock>, lifetime: Duration) -> Arc<Self> {
        Arc::new(Self {
            clock,
            lifetime,
            issued: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn issued_for(&self, action: AuthAction) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.action == action)
            .count()
    }
}

#[async_trait]
impl CredentialIssuer for CountingIssuer {
    async fn issue(&self, request: &TokenRequest) -> keepsake_core::Result<AuthToken> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        Ok(AuthToken::new(
            request.action,
            request.content_hash,
            self.clock.now() + self.lifetime,
            format!("token-{n}"),
        ))
    }
}

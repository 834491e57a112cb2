//! Per-endpoint network calls.
//!
//! [`EndpointClient`] is the seam between the engine's orchestration and the
//! wire. [`HttpEndpointClient`] speaks the HTTP contract; tests substitute
//! scripted implementations.

use crate::error::{EndpointError, EngineError, EngineResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use keepsake_core::{
    AuthToken, BlobDescriptor, ContentHash, DEFAULT_MIME_TYPE, Endpoint, EngineConfig, Identity,
    UploadReceipt,
};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;

/// Header carrying a human-readable rejection reason.
pub const REASON_HEADER: &str = "X-Reason";

/// Longest response body kept as an error message.
const MAX_ERROR_BODY: usize = 512;

/// Result type for a single endpoint call.
pub type EndpointResult<T> = std::result::Result<T, EndpointError>;

/// Bytes to upload and their declared MIME type.
#[derive(Clone, Debug)]
pub struct BlobPayload {
    /// Blob bytes.
    pub bytes: Bytes,
    /// MIME type sent as `Content-Type`.
    pub content_type: String,
    /// Original file name, kept in the returned descriptor only.
    pub filename: Option<String>,
}

impl BlobPayload {
    /// Wrap bytes, defaulting the MIME type.
    pub fn new(bytes: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type
                .filter(|t| !t.trim().is_empty())
                .unwrap_or(DEFAULT_MIME_TYPE)
                .to_string(),
            filename: None,
        }
    }

    /// Attach the original file name.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Payload size in bytes.
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// True for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// What a delete request found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteStatus {
    /// The endpoint deleted the blob.
    Deleted,
    /// The endpoint did not have the blob.
    NotFound,
}

/// Network operations against one endpoint.
#[async_trait]
pub trait EndpointClient: Send + Sync {
    /// `PUT B/upload`.
    async fn upload(
        &self,
        endpoint: &Endpoint,
        token: &AuthToken,
        payload: &BlobPayload,
    ) -> EndpointResult<UploadReceipt>;

    /// `GET B/list/{identity}`.
    async fn list(
        &self,
        endpoint: &Endpoint,
        token: &AuthToken,
        identity: &Identity,
    ) -> EndpointResult<Vec<BlobDescriptor>>;

    /// `DELETE B/{hash}`. A 404 is reported as [`DeleteStatus::NotFound`].
    async fn delete(
        &self,
        endpoint: &Endpoint,
        token: &AuthToken,
        hash: &ContentHash,
    ) -> EndpointResult<DeleteStatus>;

    /// `PUT B/mirror` asking the endpoint to copy `source_url` itself.
    async fn mirror(
        &self,
        endpoint: &Endpoint,
        token: &AuthToken,
        source_url: &str,
    ) -> EndpointResult<UploadReceipt>;

    /// `HEAD B/{hash}`. `Ok(false)` means the endpoint confirmed absence.
    async fn probe(&self, endpoint: &Endpoint, hash: &ContentHash) -> EndpointResult<bool>;

    /// `GET B/{hash}`.
    async fn download(&self, endpoint: &Endpoint, hash: &ContentHash) -> EndpointResult<Bytes>;

    /// `GET` an arbitrary blob URL (mirror source), keeping its `Content-Type`.
    async fn fetch(&self, url: &str) -> EndpointResult<BlobPayload>;
}

#[derive(Serialize)]
struct MirrorRequest<'a> {
    url: &'a str,
}

/// Server-native listing entry.
#[derive(Debug, Deserialize)]
struct WireBlob {
    url: Option<String>,
    sha256: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(rename = "type")]
    mime_type: Option<String>,
    #[serde(default)]
    uploaded: i64,
    name: Option<String>,
}

impl WireBlob {
    fn into_descriptor(self) -> Option<BlobDescriptor> {
        let content_hash = match self.sha256.as_deref() {
            Some(hex) => ContentHash::from_hex(hex).ok(),
            None => self.url.as_deref().and_then(ContentHash::extract_from_url),
        }?;
        let created_at =
            OffsetDateTime::from_unix_timestamp(self.uploaded).unwrap_or(OffsetDateTime::UNIX_EPOCH);

        Some(BlobDescriptor {
            content_hash,
            size: self.size,
            mime_type: self
                .mime_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            created_at,
            filename: self.name,
            availability: Vec::new(),
        })
    }
}

/// reqwest implementation of the wire contract.
#[derive(Clone)]
pub struct HttpEndpointClient {
    http: reqwest::Client,
    auth_scheme: String,
    request_timeout: Duration,
    transfer_timeout: Duration,
    max_blob_size: u64,
}

impl HttpEndpointClient {
    /// Build a client from engine configuration.
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("keepsake/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self::with_client(http, config))
    }

    /// Use an existing reqwest client.
    pub fn with_client(http: reqwest::Client, config: &EngineConfig) -> Self {
        Self {
            http,
            auth_scheme: config.auth_scheme.clone(),
            request_timeout: config.request_timeout(),
            transfer_timeout: config.transfer_timeout(),
            max_blob_size: config.max_blob_size,
        }
    }

    fn authorization(&self, token: &AuthToken) -> String {
        format!("{} {}", self.auth_scheme, token.payload())
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> EndpointResult<reqwest::Response> {
        let response = req.send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(rejection(response).await)
        }
    }

    /// Read a blob body, refusing anything larger than `max_blob_size`.
    async fn read_blob(&self, mut response: reqwest::Response) -> EndpointResult<Bytes> {
        let limit = self.max_blob_size;
        if let Some(declared) = response.content_length()
            && declared > limit
        {
            return Err(too_large(declared, limit));
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            let received = (body.len() + chunk.len()) as u64;
            if received > limit {
                return Err(too_large(received, limit));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

fn too_large(size: u64, limit: u64) -> EndpointError {
    EndpointError::validation(format!("blob is at least {size} bytes, limit is {limit}"))
}

/// Turn a non-2xx response into a classified error, preferring the reason header.
async fn rejection(response: reqwest::Response) -> EndpointError {
    let status = response.status();
    let reason = response
        .headers()
        .get(REASON_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);

    let message = match reason {
        Some(reason) => reason,
        None => {
            let body = response.text().await.unwrap_or_default();
            let body = body.trim();
            if body.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                body.chars().take(MAX_ERROR_BODY).collect()
            }
        }
    };
    EndpointError::from_status(status.as_u16(), message)
}

#[async_trait]
impl EndpointClient for HttpEndpointClient {
    async fn upload(
        &self,
        endpoint: &Endpoint,
        token: &AuthToken,
        payload: &BlobPayload,
    ) -> EndpointResult<UploadReceipt> {
        let url = format!("{}/upload", endpoint.url());
        let req = self
            .http
            .put(url)
            .timeout(self.transfer_timeout)
            .header(AUTHORIZATION, self.authorization(token))
            .header(CONTENT_TYPE, &payload.content_type)
            .body(payload.bytes.clone());
        Ok(self.send(req).await?.json().await?)
    }

    async fn list(
        &self,
        endpoint: &Endpoint,
        token: &AuthToken,
        identity: &Identity,
    ) -> EndpointResult<Vec<BlobDescriptor>> {
        let url = format!("{}/list/{}", endpoint.url(), identity.pubkey);
        let req = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .header(AUTHORIZATION, self.authorization(token));
        let entries: Vec<WireBlob> = self.send(req).await?.json().await?;

        let total = entries.len();
        let blobs: Vec<BlobDescriptor> = entries
            .into_iter()
            .filter_map(WireBlob::into_descriptor)
            .collect();
        if blobs.len() < total {
            tracing::warn!(
                endpoint = %endpoint,
                skipped = total - blobs.len(),
                "Skipped listing entries without a valid hash"
            );
        }
        Ok(blobs)
    }

    async fn delete(
        &self,
        endpoint: &Endpoint,
        token: &AuthToken,
        hash: &ContentHash,
    ) -> EndpointResult<DeleteStatus> {
        let url = format!("{}/{}", endpoint.url(), hash);
        let response = self
            .http
            .delete(url)
            .timeout(self.request_timeout)
            .header(AUTHORIZATION, self.authorization(token))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(DeleteStatus::Deleted),
            StatusCode::NOT_FOUND => Ok(DeleteStatus::NotFound),
            _ => Err(rejection(response).await),
        }
    }

    async fn mirror(
        &self,
        endpoint: &Endpoint,
        token: &AuthToken,
        source_url: &str,
    ) -> EndpointResult<UploadReceipt> {
        let url = format!("{}/mirror", endpoint.url());
        let req = self
            .http
            .put(url)
            .timeout(self.request_timeout)
            .header(AUTHORIZATION, self.authorization(token))
            .json(&MirrorRequest { url: source_url });
        Ok(self.send(req).await?.json().await?)
    }

    async fn probe(&self, endpoint: &Endpoint, hash: &ContentHash) -> EndpointResult<bool> {
        let url = format!("{}/{}", endpoint.url(), hash);
        let response = self
            .http
            .head(url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(rejection(response).await),
        }
    }

    async fn download(&self, endpoint: &Endpoint, hash: &ContentHash) -> EndpointResult<Bytes> {
        let url = format!("{}/{}", endpoint.url(), hash);
        let req = self.http.get(url).timeout(self.transfer_timeout);
        let response = self.send(req).await?;
        self.read_blob(response).await
    }

    async fn fetch(&self, url: &str) -> EndpointResult<BlobPayload> {
        let req = self.http.get(url).timeout(self.transfer_timeout);
        let response = self.send(req).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = self.read_blob(response).await?;
        Ok(BlobPayload::new(bytes, content_type.as_deref()))
    }
}

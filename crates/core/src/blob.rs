//! Blob descriptors and per-endpoint outcomes.

use crate::endpoint::Endpoint;
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Default MIME type when an endpoint does not report one.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// The result of one endpoint's participation in an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointOutcome {
    /// The endpoint.
    pub endpoint: Endpoint,
    /// Whether the endpoint succeeded.
    pub succeeded: bool,
    /// Failure reason, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EndpointOutcome {
    /// A successful outcome.
    pub fn success(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            succeeded: true,
            error: None,
        }
    }

    /// A failed outcome with a reason.
    pub fn failure(endpoint: Endpoint, error: impl Into<String>) -> Self {
        Self {
            endpoint,
            succeeded: false,
            error: Some(error.into()),
        }
    }
}

/// Sort outcomes by endpoint URL so results do not depend on completion order.
pub fn sort_outcomes(outcomes: &mut [EndpointOutcome]) {
    outcomes.sort_by(|a, b| a.endpoint.url().cmp(b.endpoint.url()));
}

/// A blob as known across endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    /// SHA-256 of the blob bytes; the primary key across endpoints.
    pub content_hash: ContentHash,
    /// Size in bytes.
    pub size: u64,
    /// MIME type.
    pub mime_type: String,
    /// Creation time (unix seconds on the wire).
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
    /// Original file name, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// At most one outcome per endpoint URL.
    #[serde(default)]
    pub availability: Vec<EndpointOutcome>,
}

impl BlobDescriptor {
    /// Endpoints where the blob is confirmed present.
    pub fn available_on(&self) -> impl Iterator<Item = &Endpoint> {
        self.availability
            .iter()
            .filter(|outcome| outcome.succeeded)
            .map(|outcome| &outcome.endpoint)
    }

    /// Record an outcome, replacing any previous outcome for the same endpoint.
    pub fn record(&mut self, outcome: EndpointOutcome) {
        match self
            .availability
            .iter_mut()
            .find(|existing| existing.endpoint.url() == outcome.endpoint.url())
        {
            Some(existing) => *existing = outcome,
            None => self.availability.push(outcome),
        }
    }
}

/// Successful response from an upload or mirror request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    /// Hash the endpoint stored the blob under.
    #[serde(alias = "sha256")]
    pub content_hash: ContentHash,
    /// Size reported by the endpoint.
    #[serde(default)]
    pub size: u64,
    /// MIME type reported by the endpoint.
    #[serde(rename = "type", default)]
    pub mime_type: Option<String>,
    /// Public URL of the blob on that endpoint.
    pub url: String,
}

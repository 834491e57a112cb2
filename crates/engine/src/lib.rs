//! Multi-endpoint blob replication and retrieval engine.
//!
//! The engine decides which endpoints to contact, runs operations against
//! them concurrently or in rank order, reconciles partial success, collapses
//! concurrent identical requests and reuses short-lived credentials.
//!
//! - [`retry`]: exponential backoff with jitter
//! - [`token_cache`]: action-scoped token reuse
//! - [`coalescer`]: at-most-one execution per in-flight key
//! - [`client`]: the per-endpoint wire seam and its HTTP implementation
//! - [`aggregate`]: merging per-endpoint listings
//! - [`transfer`]: the orchestrator

pub mod aggregate;
pub mod client;
pub mod clock;
pub mod coalescer;
pub mod error;
pub mod retry;
pub mod token_cache;
pub mod transfer;

pub use aggregate::{EndpointListing, ListingReport, ResultAggregator};
pub use client::{BlobPayload, DeleteStatus, EndpointClient, EndpointResult, HttpEndpointClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coalescer::{InFlightKey, RequestCoalescer};
pub use error::{EndpointError, EngineError, EngineResult, ErrorKind, Operation};
pub use retry::{RetryOutcome, RetryPolicy};
pub use token_cache::{AuthTokenCache, TokenCacheKey};
pub use transfer::{
    Availability, BlobTransferEngine, DeleteReport, Download, FallbackUpload, MirrorOutcome,
    OperationOptions, ProbeReport, ProbeResult, UploadReport,
};

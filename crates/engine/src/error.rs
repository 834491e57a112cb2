//! Engine error types.
//!
//! Failures are classified once, where they happen, into an [`ErrorKind`].
//! Nothing downstream inspects message text to decide what a failure means.

use keepsake_core::EndpointOutcome;
use std::fmt;
use thiserror::Error;

/// Failure category for a single endpoint call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection failure or timeout.
    Network,
    /// 5xx, 408, 429 or an unreadable response.
    Server,
    /// Token rejected or expired (401).
    Authentication,
    /// Bad hash, URL or payload.
    Validation,
    /// Unusable engine configuration.
    Configuration,
    /// Forbidden (403).
    Permission,
    /// The endpoint confirmed the blob is absent (404).
    NotFound,
    /// The endpoint does not implement the route (405, 501).
    Unsupported,
}

impl ErrorKind {
    /// Map an HTTP status code to a category.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Authentication,
            403 => Self::Permission,
            404 => Self::NotFound,
            405 | 501 => Self::Unsupported,
            408 | 429 => Self::Server,
            500..=599 => Self::Server,
            _ => Self::Validation,
        }
    }

    /// Whether a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Server)
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Server => "server",
            Self::Authentication => "authentication",
            Self::Validation => "validation",
            Self::Configuration => "configuration",
            Self::Permission => "permission",
            Self::NotFound => "not_found",
            Self::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classified failure from one endpoint.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub struct EndpointError {
    /// Category.
    pub kind: ErrorKind,
    /// HTTP status, when the endpoint answered.
    pub status: Option<u16>,
    /// Reason reported by the endpoint or the transport.
    pub message: String,
}

impl EndpointError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// Classify a non-2xx response.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_status(status),
            status: Some(status),
            message: message.into(),
        }
    }

    /// Connection-level failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// Invalid input or response content.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// The pending call was cut off by the caller's deadline.
    pub fn deadline_exceeded() -> Self {
        Self::network("deadline exceeded")
    }

    /// Whether a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {status}): {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl From<reqwest::Error> for EndpointError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Self::network(e.to_string())
        } else if e.is_decode() || e.is_body() {
            Self::new(ErrorKind::Server, format!("unreadable response: {e}"))
        } else if let Some(status) = e.status() {
            Self::from_status(status.as_u16(), e.to_string())
        } else if e.is_builder() {
            Self::validation(e.to_string())
        } else {
            Self::network(e.to_string())
        }
    }
}

/// Engine operations, as named in errors, logs and coalescing keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Upload to every endpoint.
    Upload,
    /// Upload to the first endpoint that accepts it.
    UploadFallback,
    /// Delete from every endpoint.
    Delete,
    /// Copy a blob from a source URL to the endpoints.
    Mirror,
    /// List an identity's blobs.
    List,
    /// Existence probe.
    Probe,
    /// Download from the first endpoint that serves it.
    Download,
}

impl Operation {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::UploadFallback => "upload_fallback",
            Self::Delete => "delete",
            Self::Mirror => "mirror",
            Self::List => "list",
            Self::Probe => "probe",
            Self::Download => "download",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Engine operation errors.
///
/// `Clone` because one coalesced failure is handed to every waiting caller.
#[derive(Clone, Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("{}", describe_failures(.operation, .attempts))]
    AllEndpointsFailed {
        operation: Operation,
        /// Every endpoint's outcome, each carrying its own reason.
        attempts: Vec<EndpointOutcome>,
        /// The failure of the last endpoint in rank order.
        last_error: EndpointError,
    },

    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),
}

impl EngineError {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Credential(_) => ErrorKind::Authentication,
            Self::AllEndpointsFailed { last_error, .. } => last_error.kind,
            Self::Endpoint(e) => e.kind,
        }
    }
}

impl From<keepsake_core::Error> for EngineError {
    fn from(e: keepsake_core::Error) -> Self {
        match e {
            keepsake_core::Error::Credential(msg) => Self::Credential(msg),
            other => Self::Validation(other.to_string()),
        }
    }
}

fn describe_failures(operation: &Operation, attempts: &[EndpointOutcome]) -> String {
    let reasons: Vec<String> = attempts
        .iter()
        .filter(|attempt| !attempt.succeeded)
        .map(|attempt| {
            format!(
                "{}: {}",
                attempt.endpoint.url(),
                attempt.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect();
    format!(
        "{operation} failed on all {} endpoint(s): {}",
        reasons.len(),
        reasons.join("; ")
    )
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

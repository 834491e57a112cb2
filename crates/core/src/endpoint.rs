//! Storage endpoints and the ordered endpoint list.
//!
//! The list itself is owned by an external directory; this module only turns a
//! raw snapshot into a normalized, deduplicated, immutable [`EndpointList`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// One independent storage server.
///
/// Identity is the normalized URL (no trailing slash).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    url: String,
    display_name: String,
}

impl Endpoint {
    /// Build an endpoint from a raw URL, normalizing it.
    pub fn parse(raw_url: &str, display_name: Option<&str>) -> crate::Result<Self> {
        let url = normalize_url(raw_url);
        let parsed =
            Url::parse(&url).map_err(|e| crate::Error::InvalidEndpoint(format!("{raw_url}: {e}")))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(crate::Error::InvalidEndpoint(format!(
                "{raw_url}: scheme must be http or https"
            )));
        }
        let Some(host) = parsed.host_str() else {
            return Err(crate::Error::InvalidEndpoint(format!(
                "{raw_url}: missing host"
            )));
        };

        let display_name = match display_name.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => host.to_string(),
        };

        Ok(Self { url, display_name })
    }

    /// The normalized base URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Human-readable name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The endpoint's origin (`scheme://host[:port]`).
    pub fn origin(&self) -> String {
        origin_of(&self.url).unwrap_or_else(|| self.url.clone())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.url)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Return the ASCII origin of a URL, or `None` if it cannot be parsed or
/// has an opaque origin.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let origin = parsed.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

fn normalize_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

/// Raw endpoint entry as handed in by the directory or read from config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointEntry {
    /// Endpoint base URL.
    pub url: String,
    /// Optional display name (defaults to the host).
    #[serde(default)]
    pub name: Option<String>,
}

impl EndpointEntry {
    /// Create an entry without a display name.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
        }
    }
}

impl From<&str> for EndpointEntry {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

/// An immutable, non-empty, ordered snapshot of endpoints.
///
/// Rank 0 is the primary. Cloning is cheap; any change produces a new list.
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointList(Arc<[Endpoint]>);

impl EndpointList {
    fn from_vec(endpoints: Vec<Endpoint>) -> Option<Self> {
        if endpoints.is_empty() {
            None
        } else {
            Some(Self(endpoints.into()))
        }
    }

    /// The rank-0 endpoint.
    pub fn primary(&self) -> &Endpoint {
        &self.0[0]
    }

    /// Number of endpoints.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; an `EndpointList` cannot be empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in rank order.
    pub fn iter(&self) -> std::slice::Iter<'_, Endpoint> {
        self.0.iter()
    }

    /// Endpoints as a slice in rank order.
    pub fn as_slice(&self) -> &[Endpoint] {
        &self.0
    }

    /// URLs sorted lexicographically, independent of rank.
    pub fn sorted_urls(&self) -> Vec<&str> {
        let mut urls: Vec<&str> = self.0.iter().map(Endpoint::url).collect();
        urls.sort_unstable();
        urls
    }

    /// A new list without endpoints sharing `origin`, preserving rank order.
    /// Returns `None` if nothing remains.
    pub fn excluding_origin(&self, origin: &str) -> Option<Self> {
        self.filtered(|endpoint| endpoint.origin() != origin)
    }

    /// A new list keeping only endpoints matching `keep`, preserving rank order.
    /// Returns `None` if nothing remains.
    pub fn filtered(&self, keep: impl Fn(&Endpoint) -> bool) -> Option<Self> {
        let remaining = self.0.iter().filter(|e| keep(e)).cloned().collect();
        Self::from_vec(remaining)
    }

    /// A single-endpoint list.
    pub fn single(endpoint: Endpoint) -> Self {
        Self(vec![endpoint].into())
    }
}

impl fmt::Debug for EndpointList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a EndpointList {
    type Item = &'a Endpoint;
    type IntoIter = std::slice::Iter<'a, Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Result of normalizing a raw endpoint snapshot.
///
/// Zero endpoints is an expected state (e.g. onboarding not finished) and
/// callers are forced to branch on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointSelection {
    /// At least one usable endpoint.
    Configured(EndpointList),
    /// No endpoints configured.
    NoEndpoints,
}

impl EndpointSelection {
    /// The list, if any.
    pub fn into_list(self) -> Option<EndpointList> {
        match self {
            Self::Configured(list) => Some(list),
            Self::NoEndpoints => None,
        }
    }

    /// True when no endpoints are configured.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::NoEndpoints)
    }
}

/// Normalizer for the endpoint list handed in by the directory collaborator.
pub struct EndpointSet;

impl EndpointSet {
    /// Strip trailing slashes, drop duplicates (first occurrence keeps its
    /// rank) and drop entries that are not valid http(s) URLs.
    pub fn normalize<I, E>(raw: I) -> EndpointSelection
    where
        I: IntoIterator<Item = E>,
        E: Into<EndpointEntry>,
    {
        let mut endpoints: Vec<Endpoint> = Vec::new();

        for entry in raw {
            let entry = entry.into();
            let endpoint = match Endpoint::parse(&entry.url, entry.name.as_deref()) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    tracing::warn!(url = %entry.url, error = %e, "Ignoring invalid endpoint");
                    continue;
                }
            };

            if endpoints.iter().any(|existing| existing.url == endpoint.url) {
                tracing::debug!(url = %endpoint.url, "Dropping duplicate endpoint");
                continue;
            }
            endpoints.push(endpoint);
        }

        match EndpointList::from_vec(endpoints) {
            Some(list) => EndpointSelection::Configured(list),
            None => EndpointSelection::NoEndpoints,
        }
    }
}

//! Merging per-endpoint listings into one view of an identity's blobs.

use crate::error::EndpointError;
use keepsake_core::{
    BlobDescriptor, ContentHash, DEFAULT_MIME_TYPE, Endpoint, EndpointOutcome, sort_outcomes,
};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// One endpoint's listing result.
#[derive(Clone, Debug)]
pub struct EndpointListing {
    /// The endpoint that was listed.
    pub endpoint: Endpoint,
    /// Its blobs, or why listing failed.
    pub result: Result<Vec<BlobDescriptor>, EndpointError>,
}

/// Merged listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListingReport {
    /// One descriptor per content hash, newest first.
    pub blobs: Vec<BlobDescriptor>,
    /// Endpoints whose listing failed. Diagnostics only: a failed listing is
    /// not evidence that a blob is absent there.
    pub failures: Vec<EndpointOutcome>,
}

impl ListingReport {
    /// Look up a blob by hash.
    pub fn get(&self, hash: &ContentHash) -> Option<&BlobDescriptor> {
        self.blobs.iter().find(|blob| blob.content_hash == *hash)
    }
}

/// Merges per-endpoint results keyed by content hash.
pub struct ResultAggregator;

impl ResultAggregator {
    /// Merge listings.
    ///
    /// Availability lists are unioned and deduplicated by endpoint URL, so
    /// feeding the same listing in twice changes nothing. The output order
    /// does not depend on the input order.
    pub fn merge<I>(listings: I) -> ListingReport
    where
        I: IntoIterator<Item = EndpointListing>,
    {
        let mut merged: BTreeMap<ContentHash, BlobDescriptor> = BTreeMap::new();
        let mut failures: Vec<EndpointOutcome> = Vec::new();

        for listing in listings {
            let blobs = match listing.result {
                Ok(blobs) => blobs,
                Err(e) => {
                    tracing::warn!(endpoint = %listing.endpoint, error = %e, "Listing failed");
                    let failure = EndpointOutcome::failure(listing.endpoint, e.to_string());
                    match failures
                        .iter_mut()
                        .find(|existing| existing.endpoint.url() == failure.endpoint.url())
                    {
                        Some(existing) => *existing = failure,
                        None => failures.push(failure),
                    }
                    continue;
                }
            };

            for blob in blobs {
                let merged_blob = match merged.entry(blob.content_hash) {
                    Entry::Occupied(occupied) => {
                        let existing = occupied.into_mut();
                        absorb(existing, blob);
                        existing
                    }
                    Entry::Vacant(vacant) => vacant.insert(blob),
                };
                merged_blob.record(EndpointOutcome::success(listing.endpoint.clone()));
            }
        }

        let mut blobs: Vec<BlobDescriptor> = merged
            .into_values()
            .map(|mut blob| {
                sort_outcomes(&mut blob.availability);
                blob
            })
            .collect();
        blobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.content_hash.cmp(&b.content_hash))
        });
        sort_outcomes(&mut failures);

        ListingReport { blobs, failures }
    }
}

/// Fold another endpoint's view of the same blob into `existing`.
fn absorb(existing: &mut BlobDescriptor, other: BlobDescriptor) {
    // Endpoints disagree on metadata; prefer what is actually known.
    if existing.size == 0 {
        existing.size = other.size;
    }
    if existing.mime_type == DEFAULT_MIME_TYPE && other.mime_type != DEFAULT_MIME_TYPE {
        existing.mime_type = other.mime_type;
    }
    if existing.filename.is_none() {
        existing.filename = other.filename;
    }
    existing.created_at = existing.created_at.min(other.created_at);

    for outcome in other.availability {
        existing.record(outcome);
    }
}

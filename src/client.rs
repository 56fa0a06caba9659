//! Capability interfaces for the backend under probe.
//!
//! The vulture only consumes three narrow contracts: push a span batch, fetch
//! a trace by id, and search for traces. Production adapters over a real wire
//! protocol live in [`crate::http`]; deterministic in-memory doubles for
//! tests live in [`crate::in_memory`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use opentelemetry::trace::TraceId;
use thiserror::Error;

use crate::synthetic::{SpanBatch, SyntheticTrace};

/// Inclusive unix-second window passed to query and search calls to narrow
/// the backend's lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    pub start_unix: u64,
    pub end_unix: u64,
}

impl TimeRange {
    /// A window of `±half` around `center`, clamped at the epoch.
    pub fn around(center: SystemTime, half: Duration) -> Self {
        let center = center
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let half = half.as_secs();
        TimeRange {
            start_unix: center.saturating_sub(half),
            end_unix: center + half,
        }
    }
}

/// Errors from the ingestion collaborator.
#[derive(Error, Debug)]
pub enum IngestError {
    /// No tenant id was available to attach to the outbound call.
    #[error("no tenant id to attach to ingest request")]
    MissingTenant,

    /// Transport or backend-level failure.
    #[error("ingest request failed: {0}")]
    Transport(String),
}

/// Errors from the trace-by-id query collaborator. `NotFound` is
/// distinguishable from transport failures so retrieval validation can
/// classify the two separately.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The backend explicitly reported the trace as absent.
    #[error("trace not found")]
    NotFound,

    /// No tenant id was available to attach to the outbound call.
    #[error("no tenant id to attach to query request")]
    MissingTenant,

    /// The response arrived but could not be decoded.
    #[error("malformed query response: {0}")]
    Malformed(String),

    /// Transport or backend-level failure.
    #[error("query request failed: {0}")]
    Transport(String),
}

/// Errors from the search collaborator.
#[derive(Error, Debug)]
pub enum SearchError {
    /// No tenant id was available to attach to the outbound call.
    #[error("no tenant id to attach to search request")]
    MissingTenant,

    /// The response arrived but could not be decoded.
    #[error("malformed search response: {0}")]
    Malformed(String),

    /// Transport or backend-level failure.
    #[error("search request failed: {0}")]
    Transport(String),
}

/// One entry of a search result set. Trace ids come back as hex strings
/// whose case and padding are encoder-dependent; compare them with
/// [`crate::seed::equal_hex_trace_ids`], never byte-for-byte. `span_count`
/// holds the number of spans the backend matched within the trace, when the
/// backend reports one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchMatch {
    pub trace_id: String,
    pub span_count: Option<u64>,
}

impl SearchMatch {
    pub fn new(trace_id: impl Into<String>) -> Self {
        SearchMatch {
            trace_id: trace_id.into(),
            span_count: None,
        }
    }
}

/// Push access to the backend's ingestion path.
#[async_trait]
pub trait SpanIngester: Send + Sync {
    /// Emit one batch of spans under the given tenant.
    async fn emit_batch(&self, tenant: &str, batch: &SpanBatch) -> Result<(), IngestError>;
}

/// Read access to the backend's trace-by-id endpoint.
#[async_trait]
pub trait TraceQuerier: Send + Sync {
    /// Fetch a trace by id, bounded by `range` to assist the lookup.
    async fn query_trace(
        &self,
        tenant: &str,
        trace_id: TraceId,
        range: TimeRange,
    ) -> Result<SyntheticTrace, QueryError>;
}

/// Read access to the backend's search endpoints.
#[async_trait]
pub trait TraceSearcher: Send + Sync {
    /// Search by a single `key=value` attribute within `range`.
    async fn search_attribute(
        &self,
        tenant: &str,
        key: &str,
        value: &str,
        range: TimeRange,
    ) -> Result<Vec<SearchMatch>, SearchError>;

    /// Search with a structured query-language expression within `range`.
    async fn search_query(
        &self,
        tenant: &str,
        query: &str,
        range: TimeRange,
    ) -> Result<Vec<SearchMatch>, SearchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_range_brackets_center() {
        let center = UNIX_EPOCH + Duration::from_secs(10_000);
        let range = TimeRange::around(center, Duration::from_secs(600));
        assert_eq!(range.start_unix, 9_400);
        assert_eq!(range.end_unix, 10_600);
    }

    #[test]
    fn time_range_clamps_at_epoch() {
        let center = UNIX_EPOCH + Duration::from_secs(100);
        let range = TimeRange::around(center, Duration::from_secs(600));
        assert_eq!(range.start_unix, 0);
    }
}

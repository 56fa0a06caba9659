//! In-memory backend double.
//!
//! [`InMemoryBackend`] implements all three client capabilities against a
//! mutex-guarded store, so tests can exercise concurrent emission and
//! validation without a network. Error injection and response overrides
//! cover the failure-classification paths.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use opentelemetry::trace::TraceId;

use crate::client::{
    IngestError, QueryError, SearchError, SearchMatch, SpanIngester, TimeRange, TraceQuerier,
    TraceSearcher,
};
use crate::synthetic::{SpanBatch, SyntheticTrace};

#[derive(Debug, Default)]
struct State {
    batches: Vec<(String, SpanBatch)>,
    ingest_error: Option<String>,
    query_error: Option<String>,
    search_error: Option<String>,
    search_results: Option<Vec<SearchMatch>>,
}

/// A backend standing in for ingestion, query, and search. All state sits
/// behind one lock because tests emit and validate concurrently.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every ingest call fail with the given message.
    pub fn fail_ingest(&self, message: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.ingest_error = Some(message.to_owned());
        }
    }

    /// Make every query call fail with a transport error.
    pub fn fail_query(&self, message: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.query_error = Some(message.to_owned());
        }
    }

    /// Make every search call fail with a transport error.
    pub fn fail_search(&self, message: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.search_error = Some(message.to_owned());
        }
    }

    /// Pin the result set returned by both search endpoints, bypassing the
    /// stored spans.
    pub fn set_search_results(&self, results: Vec<SearchMatch>) {
        if let Ok(mut state) = self.state.lock() {
            state.search_results = Some(results);
        }
    }

    /// Replace whatever is stored for `trace.trace_id` with the given trace.
    /// Lets tests serve tampered or incomplete traces.
    pub fn replace_trace(&self, tenant: &str, trace: SyntheticTrace) {
        if let Ok(mut state) = self.state.lock() {
            state
                .batches
                .retain(|(_, b)| b.spans.first().map(|s| s.trace_id) != Some(trace.trace_id));
            for batch in trace.batches {
                state.batches.push((tenant.to_owned(), batch));
            }
        }
    }

    /// Assemble the stored trace with the given id, if any spans exist.
    pub fn trace(&self, trace_id: TraceId) -> Option<SyntheticTrace> {
        let state = self.state.lock().ok()?;
        let batches: Vec<SpanBatch> = state
            .batches
            .iter()
            .filter(|(_, b)| b.spans.iter().any(|s| s.trace_id == trace_id))
            .map(|(_, b)| b.clone())
            .collect();
        if batches.is_empty() {
            None
        } else {
            Some(SyntheticTrace { trace_id, batches })
        }
    }

    /// Total number of batches recorded across all traces.
    pub fn emitted_batch_count(&self) -> usize {
        self.state.lock().map(|s| s.batches.len()).unwrap_or(0)
    }

    fn scan_search(&self, term: &SearchTerm, range: TimeRange) -> Vec<SearchMatch> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        if let Some(fixed) = &state.search_results {
            return fixed.clone();
        }

        let start = UNIX_EPOCH + Duration::from_secs(range.start_unix);
        let end = UNIX_EPOCH + Duration::from_secs(range.end_unix);
        let mut order: Vec<TraceId> = Vec::new();
        let mut counts: HashMap<TraceId, u64> = HashMap::new();
        for (_, batch) in &state.batches {
            for span in &batch.spans {
                if span.start_time < start || span.start_time > end {
                    continue;
                }
                if !term.matches(span) {
                    continue;
                }
                if !counts.contains_key(&span.trace_id) {
                    order.push(span.trace_id);
                }
                *counts.entry(span.trace_id).or_insert(0) += 1;
            }
        }
        order
            .into_iter()
            .map(|trace_id| SearchMatch {
                // unpadded hex, as some encoders return it
                trace_id: format!("{trace_id:x}"),
                span_count: counts.get(&trace_id).copied(),
            })
            .collect()
    }
}

/// The query shapes the probe issues: attribute equality and span-name
/// equality.
#[derive(Debug, PartialEq, Eq)]
enum SearchTerm {
    Attribute { key: String, value: String },
    SpanName(String),
}

impl SearchTerm {
    fn matches(&self, span: &crate::synthetic::SyntheticSpan) -> bool {
        match self {
            SearchTerm::Attribute { key, value } => span
                .attributes
                .iter()
                .any(|kv| kv.key.as_str() == key && kv.value.as_str() == value.as_str()),
            SearchTerm::SpanName(name) => span.name == *name,
        }
    }
}

#[async_trait]
impl SpanIngester for InMemoryBackend {
    async fn emit_batch(&self, tenant: &str, batch: &SpanBatch) -> Result<(), IngestError> {
        if tenant.is_empty() {
            return Err(IngestError::MissingTenant);
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| IngestError::Transport("poisoned backend lock".to_owned()))?;
        if let Some(message) = &state.ingest_error {
            return Err(IngestError::Transport(message.clone()));
        }
        state.batches.push((tenant.to_owned(), batch.clone()));
        Ok(())
    }
}

#[async_trait]
impl TraceQuerier for InMemoryBackend {
    async fn query_trace(
        &self,
        tenant: &str,
        trace_id: TraceId,
        _range: TimeRange,
    ) -> Result<SyntheticTrace, QueryError> {
        if tenant.is_empty() {
            return Err(QueryError::MissingTenant);
        }
        {
            let state = self
                .state
                .lock()
                .map_err(|_| QueryError::Transport("poisoned backend lock".to_owned()))?;
            if let Some(message) = &state.query_error {
                return Err(QueryError::Transport(message.clone()));
            }
        }
        self.trace(trace_id).ok_or(QueryError::NotFound)
    }
}

#[async_trait]
impl TraceSearcher for InMemoryBackend {
    async fn search_attribute(
        &self,
        tenant: &str,
        key: &str,
        value: &str,
        range: TimeRange,
    ) -> Result<Vec<SearchMatch>, SearchError> {
        if tenant.is_empty() {
            return Err(SearchError::MissingTenant);
        }
        if let Ok(state) = self.state.lock() {
            if let Some(message) = &state.search_error {
                return Err(SearchError::Transport(message.clone()));
            }
        }
        let term = SearchTerm::Attribute {
            key: key.to_owned(),
            value: value.to_owned(),
        };
        Ok(self.scan_search(&term, range))
    }

    async fn search_query(
        &self,
        tenant: &str,
        query: &str,
        range: TimeRange,
    ) -> Result<Vec<SearchMatch>, SearchError> {
        if tenant.is_empty() {
            return Err(SearchError::MissingTenant);
        }
        if let Ok(state) = self.state.lock() {
            if let Some(message) = &state.search_error {
                return Err(SearchError::Transport(message.clone()));
            }
        }
        let term = parse_search_query(query)
            .ok_or_else(|| SearchError::Malformed(format!("unsupported query: {query}")))?;
        Ok(self.scan_search(&term, range))
    }
}

/// Parse the `{.key = "value"}` and `{name = "value"}` expressions the
/// validators issue. Only those shapes are supported; the double does not
/// implement a query language.
fn parse_search_query(query: &str) -> Option<SearchTerm> {
    let body = query.trim().strip_prefix('{')?.strip_suffix('}')?.trim();
    let (lhs, rhs) = body.split_once('=')?;
    let lhs = lhs.trim();
    let value = rhs.trim().strip_prefix('"')?.strip_suffix('"')?;
    if lhs == "name" {
        return Some(SearchTerm::SpanName(value.to_owned()));
    }
    let key = lhs.strip_prefix('.')?.trim();
    if key.is_empty() {
        return None;
    }
    Some(SearchTerm::Attribute {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::Seed;
    use crate::synthetic::{construct_trace, equal_traces};

    fn seed() -> Seed {
        Seed::at(1_700_000_100, "test-org")
    }

    #[tokio::test]
    async fn stores_and_assembles_traces() {
        let backend = InMemoryBackend::new();
        let trace = construct_trace(&seed());
        for batch in &trace.batches {
            backend.emit_batch("test-org", batch).await.unwrap();
        }

        let range = TimeRange::around(seed().timestamp(), Duration::from_secs(600));
        let fetched = backend
            .query_trace("test-org", trace.trace_id, range)
            .await
            .unwrap();
        assert!(equal_traces(&trace, &fetched));
    }

    #[tokio::test]
    async fn unknown_trace_is_not_found() {
        let backend = InMemoryBackend::new();
        let range = TimeRange::around(seed().timestamp(), Duration::from_secs(600));
        let err = backend
            .query_trace("test-org", seed().trace_id(), range)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::NotFound));
    }

    #[tokio::test]
    async fn empty_tenant_is_rejected() {
        let backend = InMemoryBackend::new();
        let trace = construct_trace(&seed());
        let err = backend
            .emit_batch("", &trace.batches[0])
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::MissingTenant));
    }

    #[tokio::test]
    async fn searches_stored_attributes() {
        let backend = InMemoryBackend::new();
        let trace = construct_trace(&seed());
        for batch in &trace.batches {
            backend.emit_batch("test-org", batch).await.unwrap();
        }

        let attr = trace.batches[0].spans[0].attributes[0].clone();
        let range = TimeRange::around(seed().timestamp(), Duration::from_secs(1_800));
        let matches = backend
            .search_attribute("test-org", attr.key.as_str(), &attr.value.as_str(), range)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);

        let via_query = backend
            .search_query(
                "test-org",
                &format!(r#"{{.{} = "{}"}}"#, attr.key.as_str(), attr.value.as_str()),
                range,
            )
            .await
            .unwrap();
        assert_eq!(matches, via_query);
    }

    #[test]
    fn search_query_parsing() {
        assert_eq!(
            parse_search_query(r#"{.vulture-0 = "sage-12"}"#),
            Some(SearchTerm::Attribute {
                key: "vulture-0".to_owned(),
                value: "sage-12".to_owned(),
            })
        );
        assert_eq!(
            parse_search_query(r#"{name = "compact"}"#),
            Some(SearchTerm::SpanName("compact".to_owned()))
        );
        assert_eq!(parse_search_query("vulture-0 = x"), None);
        assert_eq!(parse_search_query(r#"{. = "x"}"#), None);
    }

    #[tokio::test]
    async fn searches_by_span_name_with_counts() {
        let backend = InMemoryBackend::new();
        let trace = construct_trace(&seed());
        for batch in &trace.batches {
            backend.emit_batch("test-org", batch).await.unwrap();
        }

        let name = &trace.batches[0].spans[0].name;
        let expected: u64 = trace.spans().filter(|s| &s.name == name).count() as u64;
        let range = TimeRange::around(seed().timestamp(), Duration::from_secs(1_800));
        let matches = backend
            .search_query("test-org", &format!(r#"{{name = "{name}"}}"#), range)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].span_count, Some(expected));
    }
}

//! Retrieval and search validation.
//!
//! Both validators reconstruct the expected trace from the seed and probe the
//! backend for it. Classification is ordered: a transport failure, an absent
//! trace, a structurally incomplete trace, and a content mismatch are four
//! different symptoms of four different backend bugs, and each lands in its
//! own [`ErrorCategory`].

use std::time::Duration;

use tracing::{error, info, warn};

use crate::client::{QueryError, SearchMatch, TimeRange, TraceQuerier, TraceSearcher};
use crate::metrics::{ErrorCategory, ProbeReport};
use crate::seed::{equal_hex_trace_ids, Seed};
use crate::synthetic;

/// Window around the seed passed to trace-by-id queries.
const QUERY_RANGE_HALF: Duration = Duration::from_secs(10 * 60);
/// Window around the seed passed to search queries.
const SEARCH_RANGE_HALF: Duration = Duration::from_secs(30 * 60);

/// Query the backend for the trace derived from `seed` and check it is
/// present, complete, and equal to the expected trace.
pub async fn validate_retrieval(seed: &Seed, querier: &dyn TraceQuerier) -> ProbeReport {
    let mut report = ProbeReport::one();
    let hex_id = seed.hex_id();
    let range = TimeRange::around(seed.timestamp(), QUERY_RANGE_HALF);

    info!(
        seed = seed.unix_seconds(),
        trace_id = %hex_id,
        tenant = seed.tenant(),
        "querying trace"
    );

    let actual = match querier.query_trace(seed.tenant(), seed.trace_id(), range).await {
        Ok(actual) => actual,
        Err(QueryError::NotFound) => {
            warn!(trace_id = %hex_id, "trace not found by id");
            report.fail(ErrorCategory::NotFoundById);
            return report;
        }
        Err(err) => {
            error!(trace_id = %hex_id, %err, "trace query failed");
            report.fail(ErrorCategory::RequestFailed);
            return report;
        }
    };

    if actual.batches.is_empty() {
        warn!(trace_id = %hex_id, "trace contains 0 batches");
        report.fail(ErrorCategory::NotFoundById);
        return report;
    }

    // completeness before content: a trace with dangling parents is a
    // different failure than a complete trace with drifted content
    if synthetic::has_missing_spans(&actual) {
        warn!(trace_id = %hex_id, "trace has missing spans");
        report.fail(ErrorCategory::MissingSpans);
        return report;
    }

    let expected = synthetic::construct_trace(seed);
    if !synthetic::equal_traces(&expected, &actual) {
        report.fail(ErrorCategory::IncorrectResult);
        for diff in synthetic::diff_traces(&expected, &actual) {
            error!(trace_id = %hex_id, diff, "incorrect result");
        }
    }

    report
}

/// Search for the trace derived from `seed` by one of its attributes, via
/// both the attribute endpoint and the query-language endpoint. The two
/// sub-checks are independent; one failing does not suppress the other.
pub async fn validate_search(seed: &Seed, searcher: &dyn TraceSearcher) -> ProbeReport {
    let mut report = ProbeReport::one();
    let hex_id = seed.hex_id();

    let expected = synthetic::construct_trace(seed);
    let Some(attr) = synthetic::random_searchable_attr(seed, &expected) else {
        warn!(trace_id = %hex_id, "no searchable attribute in expected trace");
        report.fail(ErrorCategory::NotFoundSearchAttribute);
        return report;
    };
    let key = attr.key.as_str();
    let value = attr.value.as_str();
    let range = TimeRange::around(seed.timestamp(), SEARCH_RANGE_HALF);

    info!(
        seed = seed.unix_seconds(),
        trace_id = %hex_id,
        key,
        value = %value,
        "searching for trace"
    );

    match searcher
        .search_attribute(seed.tenant(), key, &value, range)
        .await
    {
        Ok(matches) => {
            if !trace_in_matches(&hex_id, &matches) {
                warn!(trace_id = %hex_id, key, "trace not found via attribute search");
                report.fail(ErrorCategory::NotFoundSearch);
            }
        }
        Err(err) => {
            error!(trace_id = %hex_id, %err, "attribute search failed");
            report.fail(ErrorCategory::RequestFailed);
        }
    }

    let query = format!(r#"{{.{} = "{}"}}"#, key, value);
    match searcher.search_query(seed.tenant(), &query, range).await {
        Ok(matches) => {
            if !trace_in_matches(&hex_id, &matches) {
                warn!(trace_id = %hex_id, query, "trace not found via query-language search");
                report.fail(ErrorCategory::NotFoundTraceql);
            }
        }
        Err(err) => {
            error!(trace_id = %hex_id, %err, "query-language search failed");
            report.fail(ErrorCategory::RequestFailed);
        }
    }

    report
}

fn trace_in_matches(hex_id: &str, matches: &[SearchMatch]) -> bool {
    matches.iter().any(|m| {
        match equal_hex_trace_ids(&m.trace_id, hex_id) {
            Ok(equal) => equal,
            Err(err) => {
                warn!(trace_id = %m.trace_id, %err, "unparseable trace id in search response");
                false
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SpanIngester;
    use crate::in_memory::InMemoryBackend;
    use crate::metrics::ProbeMetrics;
    use opentelemetry::trace::SpanId;

    fn seed() -> Seed {
        Seed::at(1_700_000_100, "test-org")
    }

    async fn backend_with_expected() -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        let trace = synthetic::construct_trace(&seed());
        for batch in &trace.batches {
            backend.emit_batch("test-org", batch).await.unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn retrieval_success_reports_no_failures() {
        let backend = backend_with_expected().await;
        let report = validate_retrieval(&seed(), &backend).await;
        assert!(report.is_success(), "{:?}", report.failures());
    }

    #[tokio::test]
    async fn absent_trace_is_not_found_by_id() {
        let backend = InMemoryBackend::new();
        let report = validate_retrieval(&seed(), &backend).await;
        assert_eq!(report.failures(), &[ErrorCategory::NotFoundById]);
    }

    #[tokio::test]
    async fn transport_error_is_request_failed() {
        let backend = backend_with_expected().await;
        backend.fail_query("backend down");
        let report = validate_retrieval(&seed(), &backend).await;
        assert_eq!(report.failures(), &[ErrorCategory::RequestFailed]);
    }

    #[tokio::test]
    async fn dangling_parent_is_missing_spans() {
        let backend = backend_with_expected().await;
        let mut tampered = synthetic::construct_trace(&seed());
        tampered.batches[0].spans[0].parent_span_id = SpanId::from_hex("01234").unwrap();
        backend.replace_trace("test-org", tampered);

        let report = validate_retrieval(&seed(), &backend).await;
        assert_eq!(report.failures(), &[ErrorCategory::MissingSpans]);
    }

    #[tokio::test]
    async fn content_drift_is_incorrect_result() {
        let backend = backend_with_expected().await;
        let mut tampered = synthetic::construct_trace(&seed());
        tampered.batches[0].spans[0].name = "tampered".to_owned();
        backend.replace_trace("test-org", tampered);

        let report = validate_retrieval(&seed(), &backend).await;
        assert_eq!(report.failures(), &[ErrorCategory::IncorrectResult]);
    }

    #[tokio::test]
    async fn search_finds_the_expected_trace() {
        let backend = backend_with_expected().await;
        let report = validate_search(&seed(), &backend).await;
        assert!(report.is_success(), "{:?}", report.failures());
    }

    #[tokio::test]
    async fn foreign_results_are_not_found_exactly_once_per_endpoint() {
        let backend = InMemoryBackend::new();
        backend.set_search_results(vec![SearchMatch::new(
            "deadbeefdeadbeefdeadbeefdeadbeef",
        )]);

        let report = validate_search(&seed(), &backend).await;
        let metrics = ProbeMetrics::new();
        metrics.record(&report);
        let snap = metrics.snapshot();
        assert_eq!(snap.count(ErrorCategory::NotFoundSearch), 1);
        assert_eq!(snap.count(ErrorCategory::NotFoundTraceql), 1);
    }

    #[tokio::test]
    async fn search_transport_error_hits_both_endpoints_independently() {
        let backend = backend_with_expected().await;
        backend.fail_search("search down");
        let report = validate_search(&seed(), &backend).await;
        assert_eq!(
            report.failures(),
            &[ErrorCategory::RequestFailed, ErrorCategory::RequestFailed]
        );
    }

    #[test]
    fn match_comparison_normalizes_hex() {
        let hex_id = "00ab3f".to_owned();
        let matches = vec![SearchMatch::new("zz-not-hex"), SearchMatch::new("AB3F")];
        assert!(trace_in_matches(&hex_id, &matches));
        assert!(!trace_in_matches("ab40", &matches));
    }
}

//! Scenario-tracked span-count validation.
//!
//! The seed-based validators reconstruct a whole expected trace; the tracker
//! takes the complementary angle and checks that query-language searches
//! return the right *counts*. Each tick it emits one batch containing three
//! span groups, each findable by a different query shape, and records how
//! many spans went into each group. Once enough batches have landed it picks
//! a past window at random and asserts that each query returns the recorded
//! number of traces and, when the backend reports matched spans, the recorded
//! number of spans.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use opentelemetry::trace::{SpanId, TraceId};
use opentelemetry::KeyValue;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{error, warn};

use crate::client::{TimeRange, TraceSearcher};
use crate::metrics::{ErrorCategory, ProbeReport};
use crate::synthetic::{SpanBatch, SyntheticSpan};

/// Batches that must have been recorded before a window can be sampled. Below
/// this the backend has too little tracked data to make count assertions
/// meaningful.
pub const MIN_RECORDED_BATCHES: usize = 30;

/// Number of recorded batches a sampled window spans at most.
const WINDOW_POINTS: usize = 20;
/// Most recent batches excluded from sampling, as slack for writes still
/// being indexed.
const WINDOW_SLACK: usize = 3;

/// Spans per scenario group in one tracked batch.
const MAX_SPANS_PER_GROUP: u64 = 4;

/// Slack added on both sides of a window's search range.
const RANGE_SLACK: Duration = Duration::from_secs(1);

const SESSION_KEY: &str = "vulture-session";
const MARKER_KEY: &str = "vulture-marker";

/// Per-batch record of how many spans went into each scenario group.
#[derive(Clone, Copy, Debug)]
struct BatchRecord {
    timestamp: SystemTime,
    /// Spans carrying the session attribute; every span of the batch does,
    /// so zero marks a voided record.
    session_spans: u64,
    /// Spans named with the tracked span name.
    named_spans: u64,
    /// Spans carrying the marker attribute.
    marked_spans: u64,
}

impl BatchRecord {
    fn is_voided(&self) -> bool {
        self.session_spans == 0
    }
}

/// One query of a sampled window and the span total it is expected to match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedQuery {
    pub query: String,
    pub expected_spans: u64,
}

/// A sampled slice of the tracked history: the search range covering it, the
/// number of non-voided batches (each batch is one trace), and the per-query
/// expected span totals.
#[derive(Clone, Debug)]
pub struct TrackedWindow {
    pub range: TimeRange,
    pub expected_traces: usize,
    pub queries: Vec<TrackedQuery>,
}

/// Emits distinguishable span batches and remembers what went into them.
///
/// The tracked identifiers are suffixed with the start time in milliseconds
/// so concurrent probe processes against the same backend never count each
/// other's spans.
pub struct SpanTracker {
    session_value: String,
    span_name: String,
    marker_value: String,
    records: Vec<BatchRecord>,
    rng: StdRng,
}

impl SpanTracker {
    pub fn new(start: SystemTime) -> Self {
        let millis = start
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis();
        SpanTracker {
            session_value: format!("session-{millis}"),
            span_name: format!("tracked-{millis}"),
            marker_value: format!("marker-{millis}"),
            records: Vec::new(),
            rng: StdRng::seed_from_u64(millis as u64),
        }
    }

    /// Number of batches recorded so far, voided ones included.
    pub fn recorded_batches(&self) -> usize {
        self.records.len()
    }

    /// Build the next tracked batch and record its group sizes. All spans
    /// share a fresh random trace id and carry the session attribute; one
    /// group additionally carries the tracked span name, another the marker
    /// attribute.
    pub fn next_batch(&mut self, now: SystemTime) -> SpanBatch {
        let trace_id = self.next_trace_id();
        let base = self.rng.random_range(1..=MAX_SPANS_PER_GROUP);
        let named = self.rng.random_range(1..=MAX_SPANS_PER_GROUP);
        let marked = self.rng.random_range(1..=MAX_SPANS_PER_GROUP);

        let mut spans = Vec::with_capacity((base + named + marked) as usize);
        for _ in 0..base {
            spans.push(self.span(trace_id, now, "dispatch", None));
        }
        for _ in 0..named {
            let name = self.span_name.clone();
            spans.push(self.span(trace_id, now, &name, None));
        }
        for _ in 0..marked {
            let marker = KeyValue::new(MARKER_KEY, self.marker_value.clone());
            spans.push(self.span(trace_id, now, "deliver", Some(marker)));
        }
        // first span is the root; the rest hang off it
        let root_id = spans[0].span_id;
        for span in spans.iter_mut().skip(1) {
            span.parent_span_id = root_id;
        }

        self.records.push(BatchRecord {
            timestamp: now,
            session_spans: base + named + marked,
            named_spans: named,
            marked_spans: marked,
        });

        SpanBatch { spans }
    }

    /// Drop the most recent record from the expected counts. Called when the
    /// batch it describes failed to land in the backend.
    pub fn void_last(&mut self) {
        if let Some(last) = self.records.last_mut() {
            last.session_spans = 0;
            last.named_spans = 0;
            last.marked_spans = 0;
        }
    }

    /// Sample a random past window and the expected counts over it. Returns
    /// `None` until [`MIN_RECORDED_BATCHES`] batches have been recorded.
    pub fn sample_window(&mut self) -> Option<TrackedWindow> {
        if self.records.len() < MIN_RECORDED_BATCHES {
            return None;
        }
        let usable = self.records.len() - WINDOW_SLACK;
        let start = self.rng.random_range(0..usable);
        let end = (start + WINDOW_POINTS).min(usable);
        let window = &self.records[start..end];

        let expected_traces = window.iter().filter(|r| !r.is_voided()).count();
        let range = TimeRange {
            start_unix: unix_secs(window[0].timestamp).saturating_sub(RANGE_SLACK.as_secs()),
            end_unix: unix_secs(window[window.len() - 1].timestamp) + RANGE_SLACK.as_secs(),
        };

        let queries = vec![
            TrackedQuery {
                query: format!(r#"{{.{} = "{}"}}"#, SESSION_KEY, self.session_value),
                expected_spans: window.iter().map(|r| r.session_spans).sum(),
            },
            TrackedQuery {
                query: format!(r#"{{name = "{}"}}"#, self.span_name),
                expected_spans: window.iter().map(|r| r.named_spans).sum(),
            },
            TrackedQuery {
                query: format!(r#"{{.{} = "{}"}}"#, MARKER_KEY, self.marker_value),
                expected_spans: window.iter().map(|r| r.marked_spans).sum(),
            },
        ];

        Some(TrackedWindow {
            range,
            expected_traces,
            queries,
        })
    }

    fn next_trace_id(&mut self) -> TraceId {
        let mut id = self.rng.random::<u128>();
        while id == 0 {
            id = self.rng.random();
        }
        TraceId::from(id)
    }

    fn span(
        &mut self,
        trace_id: TraceId,
        now: SystemTime,
        name: &str,
        extra: Option<KeyValue>,
    ) -> SyntheticSpan {
        let mut attributes = vec![KeyValue::new(SESSION_KEY, self.session_value.clone())];
        if let Some(extra) = extra {
            attributes.push(extra);
        }
        let mut span_id = self.rng.random::<u64>();
        while span_id == 0 {
            span_id = self.rng.random();
        }
        SyntheticSpan {
            trace_id,
            span_id: SpanId::from(span_id),
            parent_span_id: SpanId::INVALID,
            name: name.to_owned(),
            start_time: now,
            duration: Duration::from_millis(self.rng.random_range(1..=500)),
            attributes,
            events: Vec::new(),
        }
    }
}

/// Run every query of a sampled window against the search endpoint and
/// compare what comes back with what was recorded. Each query is checked
/// independently; a count mismatch is one `traceql_incorrect_result`, a
/// failed request one `requestfailed`.
pub async fn validate_tracked(
    tenant: &str,
    window: &TrackedWindow,
    searcher: &dyn TraceSearcher,
) -> ProbeReport {
    let mut report = ProbeReport::one();

    for tracked in &window.queries {
        let matches = match searcher
            .search_query(tenant, &tracked.query, window.range)
            .await
        {
            Ok(matches) => matches,
            Err(err) => {
                error!(query = tracked.query, %err, "tracked search failed");
                report.fail(ErrorCategory::RequestFailed);
                continue;
            }
        };

        if matches.len() != window.expected_traces {
            warn!(
                query = tracked.query,
                expected = window.expected_traces,
                actual = matches.len(),
                "tracked search returned wrong trace count"
            );
            report.fail(ErrorCategory::TraceqlIncorrectResult);
            continue;
        }

        // span totals are only comparable when every match reports one
        let spans: Option<u64> = matches.iter().map(|m| m.span_count).sum();
        if let Some(spans) = spans {
            if spans != tracked.expected_spans {
                warn!(
                    query = tracked.query,
                    expected = tracked.expected_spans,
                    actual = spans,
                    "tracked search returned wrong span count"
                );
                report.fail(ErrorCategory::TraceqlIncorrectResult);
            }
        }
    }

    report
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

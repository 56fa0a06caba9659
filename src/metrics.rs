//! Outcome aggregation.
//!
//! All probe loops report into one [`ProbeMetrics`] sink, so every counter is
//! an atomic. Exposure over a scrape endpoint is deliberately out of scope;
//! [`ProbeMetrics::snapshot`] is the consumption surface for tests and for
//! shutdown logging.

use std::sync::atomic::{AtomicU64, Ordering};

/// Classification of a failed probe, mirroring the labels the original
/// deployment alerted on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Trace-by-id lookup reported the trace absent (or empty).
    NotFoundById,
    /// Retrieved trace references parent spans it does not contain.
    MissingSpans,
    /// Retrieved trace is complete but not equal to the expected trace.
    IncorrectResult,
    /// Transport or backend failure on any probe request.
    RequestFailed,
    /// Attribute search did not return the expected trace.
    NotFoundSearch,
    /// Query-language search did not return the expected trace.
    NotFoundTraceql,
    /// The expected trace had no indexable attribute to search for.
    NotFoundSearchAttribute,
    /// Emitting a span batch failed.
    WriteFailed,
    /// A tracked query-language search returned the wrong trace or span
    /// counts.
    TraceqlIncorrectResult,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::NotFoundById,
        ErrorCategory::MissingSpans,
        ErrorCategory::IncorrectResult,
        ErrorCategory::RequestFailed,
        ErrorCategory::NotFoundSearch,
        ErrorCategory::NotFoundTraceql,
        ErrorCategory::NotFoundSearchAttribute,
        ErrorCategory::WriteFailed,
        ErrorCategory::TraceqlIncorrectResult,
    ];

    /// Metric label for this category.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::NotFoundById => "notfound_byid",
            ErrorCategory::MissingSpans => "missingspans",
            ErrorCategory::IncorrectResult => "incorrectresult",
            ErrorCategory::RequestFailed => "requestfailed",
            ErrorCategory::NotFoundSearch => "notfound_search",
            ErrorCategory::NotFoundTraceql => "notfound_traceql",
            ErrorCategory::NotFoundSearchAttribute => "notfound_search_attribute",
            ErrorCategory::WriteFailed => "write_failed",
            ErrorCategory::TraceqlIncorrectResult => "traceql_incorrect_result",
        }
    }

    /// Whether this category counts toward the overall error total in soak
    /// mode. A trace without a searchable attribute is tracked but benign.
    pub fn counts_toward_total(self) -> bool {
        !matches!(self, ErrorCategory::NotFoundSearchAttribute)
    }

    fn index(self) -> usize {
        match self {
            ErrorCategory::NotFoundById => 0,
            ErrorCategory::MissingSpans => 1,
            ErrorCategory::IncorrectResult => 2,
            ErrorCategory::RequestFailed => 3,
            ErrorCategory::NotFoundSearch => 4,
            ErrorCategory::NotFoundTraceql => 5,
            ErrorCategory::NotFoundSearchAttribute => 6,
            ErrorCategory::WriteFailed => 7,
            ErrorCategory::TraceqlIncorrectResult => 8,
        }
    }
}

/// The outcome of one probe tick: how many traces were inspected and which
/// failure categories were hit.
#[derive(Debug, Default)]
pub struct ProbeReport {
    requested: u64,
    failures: Vec<ErrorCategory>,
}

impl ProbeReport {
    /// A report covering one inspected trace.
    pub fn one() -> Self {
        ProbeReport {
            requested: 1,
            failures: Vec::new(),
        }
    }

    pub fn fail(&mut self, category: ErrorCategory) {
        self.failures.push(category);
    }

    pub fn failures(&self) -> &[ErrorCategory] {
        &self.failures
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Concurrent counters shared by the write, read, and search loops.
#[derive(Debug, Default)]
pub struct ProbeMetrics {
    traces_inspected: AtomicU64,
    error_total: AtomicU64,
    by_category: [AtomicU64; 9],
}

impl ProbeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one tick's outcome into the counters.
    pub fn record(&self, report: &ProbeReport) {
        self.traces_inspected
            .fetch_add(report.requested, Ordering::Relaxed);
        for &category in &report.failures {
            self.record_failure(category);
        }
    }

    /// Count a single failure outside a full report (e.g. a write error).
    pub fn record_failure(&self, category: ErrorCategory) {
        self.by_category[category.index()].fetch_add(1, Ordering::Relaxed);
        if category.counts_toward_total() {
            self.error_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut by_category = [0u64; 9];
        for (slot, counter) in by_category.iter_mut().zip(self.by_category.iter()) {
            *slot = counter.load(Ordering::Relaxed);
        }
        MetricsSnapshot {
            traces_inspected: self.traces_inspected.load(Ordering::Relaxed),
            error_total: self.error_total.load(Ordering::Relaxed),
            by_category,
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub traces_inspected: u64,
    pub error_total: u64,
    by_category: [u64; 9],
}

impl MetricsSnapshot {
    pub fn count(&self, category: ErrorCategory) -> u64 {
        self.by_category[category.index()]
    }

    /// (label, count) pairs for every category, for shutdown logging.
    pub fn labeled_counts(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        ErrorCategory::ALL
            .iter()
            .map(|&c| (c.as_str(), self.count(c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_categories_and_total() {
        let metrics = ProbeMetrics::new();
        let mut report = ProbeReport::one();
        report.fail(ErrorCategory::MissingSpans);
        report.fail(ErrorCategory::RequestFailed);
        metrics.record(&report);
        metrics.record(&ProbeReport::one());

        let snap = metrics.snapshot();
        assert_eq!(snap.traces_inspected, 2);
        assert_eq!(snap.error_total, 2);
        assert_eq!(snap.count(ErrorCategory::MissingSpans), 1);
        assert_eq!(snap.count(ErrorCategory::RequestFailed), 1);
        assert_eq!(snap.count(ErrorCategory::IncorrectResult), 0);
    }

    #[test]
    fn missing_search_attribute_is_tracked_but_benign() {
        let metrics = ProbeMetrics::new();
        let mut report = ProbeReport::one();
        report.fail(ErrorCategory::NotFoundSearchAttribute);
        metrics.record(&report);

        let snap = metrics.snapshot();
        assert_eq!(snap.count(ErrorCategory::NotFoundSearchAttribute), 1);
        assert_eq!(snap.error_total, 0);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        use std::sync::Arc;
        let metrics = Arc::new(ProbeMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        metrics.record_failure(ErrorCategory::WriteFailed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot().count(ErrorCategory::WriteFailed), 8_000);
    }

    #[test]
    fn labels_match_alerting_names() {
        assert_eq!(ErrorCategory::NotFoundById.as_str(), "notfound_byid");
        assert_eq!(ErrorCategory::IncorrectResult.as_str(), "incorrectresult");
        assert_eq!(
            ErrorCategory::NotFoundSearchAttribute.as_str(),
            "notfound_search_attribute"
        );
    }
}

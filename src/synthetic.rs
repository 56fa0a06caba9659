//! Deterministic synthetic trace construction and comparison.
//!
//! [`construct_trace`] is a pure function of a [`Seed`]: the same seed always
//! yields the same span structure, ids, attributes, and events. It is called
//! once on the write path to produce the data that is emitted, and again on
//! the validation path to reconstruct the expected trace for comparison. The
//! two results must be bit-identical, which is why every random draw comes
//! from the seed-keyed RNG and nothing else.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use opentelemetry::trace::{SpanId, TraceId};
use opentelemetry::{KeyValue, Value};
use rand::{rngs::StdRng, Rng};

use crate::seed::{Seed, PURPOSE_GENERATION, PURPOSE_SEARCH_ATTR};

/// Maximum number of continuation (long-write) rounds after the initial
/// emission. The actual count per trace is drawn from the seed.
pub const MAX_LONG_WRITES: u64 = 2;

const MAX_BATCHES_PER_ROUND: usize = 2;
const MAX_SPANS_PER_BATCH: usize = 5;
const MAX_ATTRS_PER_SPAN: usize = 5;
const MAX_EVENTS_PER_SPAN: usize = 5;
const MAX_ATTRS_PER_EVENT: usize = 2;

const SPAN_NAMES: [&str; 8] = [
    "get", "put", "list", "delete", "flush", "compact", "query", "sync",
];
const ATTR_KEYS: [&str; 4] = ["vulture-0", "vulture-1", "vulture-2", "vulture-3"];
const ATTR_WORDS: [&str; 6] = ["amber", "cobalt", "crimson", "ochre", "sage", "teal"];
const EVENT_NAMES: [&str; 5] = ["retry", "cache-miss", "flushed", "enqueued", "acked"];

/// A timestamped log entry nested inside a span.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: SystemTime,
    pub attributes: Vec<KeyValue>,
}

/// One span of a synthetic trace. Roots carry [`SpanId::INVALID`] as their
/// parent id.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticSpan {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: SpanId,
    pub name: String,
    pub start_time: SystemTime,
    pub duration: Duration,
    pub attributes: Vec<KeyValue>,
    pub events: Vec<SpanEvent>,
}

/// A batch of spans emitted (or retrieved) together.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpanBatch {
    pub spans: Vec<SyntheticSpan>,
}

/// A full trace: one id, one or more batches. The backend is expected to
/// merge batches arriving in separate writes, so batch grouping carries no
/// meaning for equality.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticTrace {
    pub trace_id: TraceId,
    pub batches: Vec<SpanBatch>,
}

impl SyntheticTrace {
    /// Iterate over every span regardless of batch grouping.
    pub fn spans(&self) -> impl Iterator<Item = &SyntheticSpan> {
        self.batches.iter().flat_map(|b| b.spans.iter())
    }

    pub fn span_count(&self) -> usize {
        self.batches.iter().map(|b| b.spans.len()).sum()
    }
}

/// Number of continuation rounds the trace for `seed` is emitted over, after
/// the initial write. Zero means a short (single-emission) trace.
///
/// Drawn first from the generation stream so [`construct_trace`] and the
/// readiness guard always agree.
pub fn long_writes_for(seed: &Seed) -> u64 {
    let mut rng = seed.rng(PURPOSE_GENERATION);
    rng.random_range(0..=MAX_LONG_WRITES)
}

/// Construct the expected trace for `seed`. Pure and side-effect free.
pub fn construct_trace(seed: &Seed) -> SyntheticTrace {
    let trace_id = seed.trace_id();
    let mut rng = seed.rng(PURPOSE_GENERATION);

    let rounds = rng.random_range(0..=MAX_LONG_WRITES) as usize + 1;
    let batches_per_round = rng.random_range(1..=MAX_BATCHES_PER_ROUND);
    let batch_sizes: Vec<usize> = (0..rounds * batches_per_round)
        .map(|_| rng.random_range(1..=MAX_SPANS_PER_BATCH))
        .collect();
    let total_spans: usize = batch_sizes.iter().sum();

    let mut seen_ids: HashSet<u64> = HashSet::with_capacity(total_spans);
    let mut spans: Vec<SyntheticSpan> = Vec::with_capacity(total_spans);

    for i in 0..total_spans {
        let span_id = next_span_id(&mut rng, &mut seen_ids);
        // span 0 is the root; every later span hangs off an earlier one, so
        // the trace is a single connected tree
        let parent_span_id = if i == 0 {
            SpanId::INVALID
        } else {
            spans[rng.random_range(0..i)].span_id
        };

        let start_time = seed.timestamp() + Duration::from_millis(rng.random_range(0..5_000));
        let duration = Duration::from_millis(rng.random_range(1..=2_000));
        let name = SPAN_NAMES[rng.random_range(0..SPAN_NAMES.len())].to_owned();
        let attributes = random_attributes(&mut rng, 1, MAX_ATTRS_PER_SPAN);

        let event_count = rng.random_range(0..=MAX_EVENTS_PER_SPAN);
        let events = (0..event_count)
            .map(|_| SpanEvent {
                name: EVENT_NAMES[rng.random_range(0..EVENT_NAMES.len())].to_owned(),
                timestamp: start_time + Duration::from_millis(rng.random_range(0..1_000)),
                attributes: random_attributes(&mut rng, 0, MAX_ATTRS_PER_EVENT),
            })
            .collect();

        spans.push(SyntheticSpan {
            trace_id,
            span_id,
            parent_span_id,
            name,
            start_time,
            duration,
            attributes,
            events,
        });
    }

    let mut batches = Vec::with_capacity(batch_sizes.len());
    let mut rest = spans;
    for size in batch_sizes {
        let tail = rest.split_off(size);
        batches.push(SpanBatch { spans: rest });
        rest = tail;
    }

    SyntheticTrace { trace_id, batches }
}

fn next_span_id(rng: &mut StdRng, seen: &mut HashSet<u64>) -> SpanId {
    loop {
        let id = rng.random::<u64>();
        if id != 0 && seen.insert(id) {
            return SpanId::from(id);
        }
    }
}

fn random_attributes(rng: &mut StdRng, min: usize, max: usize) -> Vec<KeyValue> {
    let count = rng.random_range(min..=max);
    (0..count)
        .map(|_| {
            let key = ATTR_KEYS[rng.random_range(0..ATTR_KEYS.len())];
            let word = ATTR_WORDS[rng.random_range(0..ATTR_WORDS.len())];
            let value = format!("{}-{}", word, rng.random_range(0..1_000u32));
            KeyValue::new(key, value)
        })
        .collect()
}

/// Sort a trace into canonical form: batches merged, spans ordered by span
/// id, attributes by key then value, events by timestamp then name. Two
/// traces with the same content always canonicalize identically, regardless
/// of the grouping the backend returned them in.
pub fn canonicalize(trace: &mut SyntheticTrace) {
    let mut spans: Vec<SyntheticSpan> = trace
        .batches
        .drain(..)
        .flat_map(|b| b.spans)
        .collect();

    for span in &mut spans {
        sort_attributes(&mut span.attributes);
        span.events
            .sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.name.cmp(&b.name)));
        for event in &mut span.events {
            sort_attributes(&mut event.attributes);
        }
    }
    spans.sort_by_key(|s| s.span_id.to_bytes());

    trace.batches = vec![SpanBatch { spans }];
}

fn sort_attributes(attributes: &mut [KeyValue]) {
    attributes.sort_by(|a, b| {
        a.key
            .as_str()
            .cmp(b.key.as_str())
            .then_with(|| a.value.as_str().cmp(&b.value.as_str()))
    });
}

/// Deep equality after canonical sorting of both sides.
pub fn equal_traces(expected: &SyntheticTrace, actual: &SyntheticTrace) -> bool {
    let mut expected = expected.clone();
    let mut actual = actual.clone();
    canonicalize(&mut expected);
    canonicalize(&mut actual);
    expected == actual
}

/// Field-by-field description of where two canonicalized traces diverge, for
/// logging alongside an `incorrect_result`. The inequality itself is the
/// failure signal; this exists to aid debugging.
pub fn diff_traces(expected: &SyntheticTrace, actual: &SyntheticTrace) -> Vec<String> {
    let mut expected = expected.clone();
    let mut actual = actual.clone();
    canonicalize(&mut expected);
    canonicalize(&mut actual);

    let mut diffs = Vec::new();
    if expected.trace_id != actual.trace_id {
        diffs.push(format!(
            "trace_id: {} != {}",
            expected.trace_id, actual.trace_id
        ));
    }

    let exp_spans = &expected.batches[0].spans;
    let act_spans = &actual.batches[0].spans;
    if exp_spans.len() != act_spans.len() {
        diffs.push(format!(
            "span count: {} != {}",
            exp_spans.len(),
            act_spans.len()
        ));
    }

    for (i, (e, a)) in exp_spans.iter().zip(act_spans.iter()).enumerate() {
        if e == a {
            continue;
        }
        if e.span_id != a.span_id {
            diffs.push(format!("span[{i}].span_id: {} != {}", e.span_id, a.span_id));
        } else if e.parent_span_id != a.parent_span_id {
            diffs.push(format!(
                "span[{i}].parent_span_id: {} != {}",
                e.parent_span_id, a.parent_span_id
            ));
        } else if e.name != a.name {
            diffs.push(format!("span[{i}].name: {:?} != {:?}", e.name, a.name));
        } else if e.start_time != a.start_time {
            diffs.push(format!("span[{i}].start_time differs"));
        } else if e.duration != a.duration {
            diffs.push(format!(
                "span[{i}].duration: {:?} != {:?}",
                e.duration, a.duration
            ));
        } else if e.attributes != a.attributes {
            diffs.push(format!(
                "span[{i}].attributes: {:?} != {:?}",
                e.attributes, a.attributes
            ));
        } else if e.events != a.events {
            diffs.push(format!("span[{i}].events differ"));
        }
    }

    diffs
}

/// True when some span references a parent id that no span in the trace
/// carries. A retrieved trace with dangling parents is structurally
/// incomplete, which is a distinct failure from content mismatch and is
/// checked first.
pub fn has_missing_spans(trace: &SyntheticTrace) -> bool {
    let ids: HashSet<SpanId> = trace.spans().map(|s| s.span_id).collect();
    trace
        .spans()
        .filter(|s| s.parent_span_id != SpanId::INVALID)
        .any(|s| !ids.contains(&s.parent_span_id))
}

/// Pick one string attribute from the trace for search validation.
/// Deterministic given the seed so a failed search can be replayed. Returns
/// `None` when the trace carries no indexable attribute.
pub fn random_searchable_attr(seed: &Seed, trace: &SyntheticTrace) -> Option<KeyValue> {
    let candidates: Vec<&KeyValue> = trace
        .spans()
        .flat_map(|s| s.attributes.iter())
        .filter(|kv| matches!(kv.value, Value::String(_)))
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let mut rng = seed.rng(PURPOSE_SEARCH_ATTR);
    Some(candidates[rng.random_range(0..candidates.len())].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> Seed {
        Seed::at(1_700_000_100, "test-org")
    }

    #[test]
    fn construction_is_deterministic() {
        let a = construct_trace(&seed());
        let b = construct_trace(&seed());
        assert_eq!(a, b);
        assert!(equal_traces(&a, &b));
    }

    #[test]
    fn different_seeds_give_different_traces() {
        let a = construct_trace(&Seed::at(1_700_000_100, "test-org"));
        let b = construct_trace(&Seed::at(1_700_000_115, "test-org"));
        assert_ne!(a.trace_id, b.trace_id);
        assert!(!equal_traces(&a, &b));
    }

    #[test]
    fn generated_traces_have_no_dangling_parents() {
        for offset in 0..50u64 {
            let trace = construct_trace(&Seed::at(1_700_000_100 + offset * 15, "test-org"));
            assert!(!has_missing_spans(&trace), "seed offset {offset}");
        }
    }

    #[test]
    fn every_span_carries_the_trace_id() {
        let trace = construct_trace(&seed());
        assert!(trace.spans().all(|s| s.trace_id == trace.trace_id));
    }

    #[test]
    fn exactly_one_root_span() {
        let trace = construct_trace(&seed());
        let roots = trace
            .spans()
            .filter(|s| s.parent_span_id == SpanId::INVALID)
            .count();
        assert_eq!(roots, 1);
    }

    #[test]
    fn long_writes_agree_with_batch_layout() {
        for offset in 0..50u64 {
            let s = Seed::at(1_700_000_100 + offset * 15, "test-org");
            let trace = construct_trace(&s);
            let rounds = long_writes_for(&s) as usize + 1;
            assert_eq!(trace.batches.len() % rounds, 0, "seed offset {offset}");
        }
    }

    #[test]
    fn equality_ignores_batch_grouping_and_order() {
        let trace = construct_trace(&seed());
        let mut regrouped = SyntheticTrace {
            trace_id: trace.trace_id,
            batches: vec![SpanBatch {
                spans: trace.spans().cloned().collect(),
            }],
        };
        regrouped.batches[0].spans.reverse();
        assert!(equal_traces(&trace, &regrouped));
    }

    #[test]
    fn missing_parent_is_detected() {
        let mut trace = construct_trace(&seed());
        // dangling parent reference, as the backend would return it after
        // dropping an ingested span
        trace.batches[0].spans[0].parent_span_id = SpanId::from_hex("01234").unwrap();
        assert!(has_missing_spans(&trace));
    }

    #[test]
    fn content_drift_is_detected_and_diffed() {
        let expected = construct_trace(&seed());
        let mut actual = expected.clone();
        let span = &mut actual.batches[0].spans[0];
        span.name = "tampered".to_owned();

        assert!(!equal_traces(&expected, &actual));
        let diffs = diff_traces(&expected, &actual);
        assert!(!diffs.is_empty());
        assert!(diffs.iter().any(|d| d.contains("tampered")), "{diffs:?}");
    }

    #[test]
    fn identical_traces_produce_no_diff() {
        let trace = construct_trace(&seed());
        assert!(diff_traces(&trace, &trace.clone()).is_empty());
    }

    #[test]
    fn searchable_attr_is_deterministic() {
        let trace = construct_trace(&seed());
        let a = random_searchable_attr(&seed(), &trace);
        let b = random_searchable_attr(&seed(), &trace);
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn searchable_attr_absent_on_bare_trace() {
        let s = seed();
        let mut trace = construct_trace(&s);
        for batch in &mut trace.batches {
            for span in &mut batch.spans {
                span.attributes.clear();
            }
        }
        assert_eq!(random_searchable_attr(&s, &trace), None);
    }
}

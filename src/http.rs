//! Production HTTP adapters for the client traits.
//!
//! Speaks the backend's JSON API: span pushes go to `{push}/v1/traces` as an
//! OTLP-shaped payload, trace lookups hit `{query}/api/traces/{id}`, and both
//! search endpoints live under `{query}/api/search`. The tenant rides in the
//! `X-Scope-OrgID` header on every call. 64-bit nanosecond timestamps are
//! string-encoded on the wire, matching protobuf JSON mapping rules.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use opentelemetry::trace::{SpanId, TraceId};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::client::{
    IngestError, QueryError, SearchError, SearchMatch, SpanIngester, TimeRange, TraceQuerier,
    TraceSearcher,
};
use crate::synthetic::{SpanBatch, SpanEvent, SyntheticSpan, SyntheticTrace};

const TENANT_HEADER: &str = "X-Scope-OrgID";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum HttpClientError {
    #[error("invalid endpoint {0:?}: {1}")]
    InvalidEndpoint(String, url::ParseError),

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Adapter over a backend's push and query HTTP surfaces. Implements all
/// three client traits so one instance serves the whole probe.
#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    push_base: String,
    query_base: String,
    auth_token: Option<String>,
}

impl HttpBackend {
    pub fn new(push_endpoint: &str, query_endpoint: &str) -> Result<Self, HttpClientError> {
        for endpoint in [push_endpoint, query_endpoint] {
            Url::parse(endpoint)
                .map_err(|err| HttpClientError::InvalidEndpoint(endpoint.to_owned(), err))?;
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(HttpBackend {
            client,
            push_base: push_endpoint.trim_end_matches('/').to_owned(),
            query_base: query_endpoint.trim_end_matches('/').to_owned(),
            auth_token: None,
        })
    }

    /// Send `Authorization: Basic base64(tenant:token)` on every call, for
    /// backends gated by an access-policy token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn authorize(
        &self,
        request: reqwest::RequestBuilder,
        tenant: &str,
    ) -> reqwest::RequestBuilder {
        let request = request.header(TENANT_HEADER, tenant);
        match &self.auth_token {
            Some(token) => request.basic_auth(tenant, Some(token)),
            None => request,
        }
    }
}

#[async_trait]
impl SpanIngester for HttpBackend {
    async fn emit_batch(&self, tenant: &str, batch: &SpanBatch) -> Result<(), IngestError> {
        if tenant.is_empty() {
            return Err(IngestError::MissingTenant);
        }
        let url = format!("{}/v1/traces", self.push_base);
        let payload = WireTraceData::from_batches(std::slice::from_ref(batch));
        let response = self
            .authorize(self.client.post(&url), tenant)
            .json(&payload)
            .send()
            .await
            .map_err(|err| IngestError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Transport(format!(
                "push returned status {status}"
            )));
        }
        debug!(spans = batch.spans.len(), "pushed span batch");
        Ok(())
    }
}

#[async_trait]
impl TraceQuerier for HttpBackend {
    async fn query_trace(
        &self,
        tenant: &str,
        trace_id: TraceId,
        range: TimeRange,
    ) -> Result<SyntheticTrace, QueryError> {
        if tenant.is_empty() {
            return Err(QueryError::MissingTenant);
        }
        let url = format!("{}/api/traces/{:032x}", self.query_base, trace_id);
        let response = self
            .authorize(self.client.get(&url), tenant)
            .query(&[
                ("start", range.start_unix.to_string()),
                ("end", range.end_unix.to_string()),
            ])
            .send()
            .await
            .map_err(|err| QueryError::Transport(err.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(QueryError::NotFound);
        }
        if !status.is_success() {
            return Err(QueryError::Transport(format!(
                "query returned status {status}"
            )));
        }
        let payload: WireTraceData = response
            .json()
            .await
            .map_err(|err| QueryError::Malformed(err.to_string()))?;
        payload.into_trace(trace_id)
    }
}

#[async_trait]
impl TraceSearcher for HttpBackend {
    async fn search_attribute(
        &self,
        tenant: &str,
        key: &str,
        value: &str,
        range: TimeRange,
    ) -> Result<Vec<SearchMatch>, SearchError> {
        self.search(tenant, ("tags", format!("{key}={value}")), range)
            .await
    }

    async fn search_query(
        &self,
        tenant: &str,
        query: &str,
        range: TimeRange,
    ) -> Result<Vec<SearchMatch>, SearchError> {
        self.search(tenant, ("q", query.to_owned()), range).await
    }
}

impl HttpBackend {
    async fn search(
        &self,
        tenant: &str,
        term: (&str, String),
        range: TimeRange,
    ) -> Result<Vec<SearchMatch>, SearchError> {
        if tenant.is_empty() {
            return Err(SearchError::MissingTenant);
        }
        let url = format!("{}/api/search", self.query_base);
        let response = self
            .authorize(self.client.get(&url), tenant)
            .query(&[
                term,
                ("start", range.start_unix.to_string()),
                ("end", range.end_unix.to_string()),
            ])
            .send()
            .await
            .map_err(|err| SearchError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Transport(format!(
                "search returned status {status}"
            )));
        }
        let payload: WireSearchResponse = response
            .json()
            .await
            .map_err(|err| SearchError::Malformed(err.to_string()))?;
        Ok(payload
            .traces
            .into_iter()
            .map(|entry| SearchMatch {
                span_count: entry.span_count(),
                trace_id: entry.trace_id,
            })
            .collect())
    }
}

// ---- wire representation ----

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct WireTraceData {
    #[serde(default)]
    resource_spans: Vec<WireResourceSpans>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct WireResourceSpans {
    #[serde(default)]
    scope_spans: Vec<WireScopeSpans>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct WireScopeSpans {
    #[serde(default)]
    spans: Vec<WireSpan>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WireSpan {
    trace_id: String,
    span_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    parent_span_id: String,
    name: String,
    start_time_unix_nano: String,
    end_time_unix_nano: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<WireKeyValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    events: Vec<WireEvent>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    time_unix_nano: String,
    name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<WireKeyValue>,
}

#[derive(Serialize, Deserialize, Debug)]
struct WireKeyValue {
    key: String,
    value: WireValue,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WireValue {
    string_value: String,
}

#[derive(Deserialize, Debug, Default)]
struct WireSearchResponse {
    #[serde(default)]
    traces: Vec<WireSearchEntry>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct WireSearchEntry {
    #[serde(rename = "traceID", default)]
    trace_id: String,
    #[serde(default)]
    span_sets: Vec<WireSpanSet>,
    #[serde(default)]
    span_set: Option<WireSpanSet>,
}

#[derive(Deserialize, Debug, Default)]
struct WireSpanSet {
    #[serde(default)]
    spans: Vec<serde_json::Value>,
    #[serde(default)]
    matched: Option<u64>,
}

impl WireSpanSet {
    fn span_count(&self) -> u64 {
        self.matched.unwrap_or(self.spans.len() as u64)
    }
}

impl WireSearchEntry {
    /// Matched-span count across span sets, `None` when the backend reported
    /// no span detail at all.
    fn span_count(&self) -> Option<u64> {
        if !self.span_sets.is_empty() {
            return Some(self.span_sets.iter().map(WireSpanSet::span_count).sum());
        }
        self.span_set.as_ref().map(WireSpanSet::span_count)
    }
}

impl WireTraceData {
    fn from_batches(batches: &[SpanBatch]) -> Self {
        WireTraceData {
            resource_spans: batches
                .iter()
                .map(|batch| WireResourceSpans {
                    scope_spans: vec![WireScopeSpans {
                        spans: batch.spans.iter().map(WireSpan::from_span).collect(),
                    }],
                })
                .collect(),
        }
    }

    /// Each `resourceSpans` entry maps to one batch; scopes within it are
    /// flattened since batch grouping carries no meaning for comparison.
    fn into_trace(self, trace_id: TraceId) -> Result<SyntheticTrace, QueryError> {
        let mut batches = Vec::with_capacity(self.resource_spans.len());
        for resource in self.resource_spans {
            let mut spans = Vec::new();
            for scope in resource.scope_spans {
                for span in scope.spans {
                    spans.push(span.into_span()?);
                }
            }
            batches.push(SpanBatch { spans });
        }
        Ok(SyntheticTrace { trace_id, batches })
    }
}

impl WireSpan {
    fn from_span(span: &SyntheticSpan) -> Self {
        let start = unix_nanos(span.start_time);
        WireSpan {
            trace_id: format!("{:032x}", span.trace_id),
            span_id: format!("{:016x}", span.span_id),
            parent_span_id: if span.parent_span_id == SpanId::INVALID {
                String::new()
            } else {
                format!("{:016x}", span.parent_span_id)
            },
            name: span.name.clone(),
            start_time_unix_nano: start.to_string(),
            end_time_unix_nano: (start + span.duration.as_nanos() as u64).to_string(),
            attributes: span.attributes.iter().map(WireKeyValue::from_attr).collect(),
            events: span
                .events
                .iter()
                .map(|event| WireEvent {
                    time_unix_nano: unix_nanos(event.timestamp).to_string(),
                    name: event.name.clone(),
                    attributes: event.attributes.iter().map(WireKeyValue::from_attr).collect(),
                })
                .collect(),
        }
    }

    fn into_span(self) -> Result<SyntheticSpan, QueryError> {
        let trace_id = TraceId::from_hex(&self.trace_id)
            .map_err(|_| QueryError::Malformed(format!("bad trace id {:?}", self.trace_id)))?;
        let span_id = SpanId::from_hex(&self.span_id)
            .map_err(|_| QueryError::Malformed(format!("bad span id {:?}", self.span_id)))?;
        let parent_span_id = if self.parent_span_id.is_empty() {
            SpanId::INVALID
        } else {
            SpanId::from_hex(&self.parent_span_id).map_err(|_| {
                QueryError::Malformed(format!("bad parent span id {:?}", self.parent_span_id))
            })?
        };
        let start = parse_nanos(&self.start_time_unix_nano)?;
        let end = parse_nanos(&self.end_time_unix_nano)?;
        let mut events = Vec::with_capacity(self.events.len());
        for event in self.events {
            events.push(SpanEvent {
                name: event.name,
                timestamp: nanos_to_time(parse_nanos(&event.time_unix_nano)?),
                attributes: event.attributes.into_iter().map(WireKeyValue::into_attr).collect(),
            });
        }
        Ok(SyntheticSpan {
            trace_id,
            span_id,
            parent_span_id,
            name: self.name,
            start_time: nanos_to_time(start),
            duration: Duration::from_nanos(end.saturating_sub(start)),
            attributes: self
                .attributes
                .into_iter()
                .map(WireKeyValue::into_attr)
                .collect(),
            events,
        })
    }
}

impl WireKeyValue {
    fn from_attr(attr: &KeyValue) -> Self {
        WireKeyValue {
            key: attr.key.to_string(),
            value: WireValue {
                string_value: attr.value.as_str().into_owned(),
            },
        }
    }

    fn into_attr(self) -> KeyValue {
        KeyValue::new(self.key, self.value.string_value)
    }
}

fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

fn nanos_to_time(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

fn parse_nanos(raw: &str) -> Result<u64, QueryError> {
    raw.parse::<u64>()
        .map_err(|_| QueryError::Malformed(format!("bad timestamp {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::Seed;
    use crate::synthetic::{canonicalize, construct_trace};
    use std::time::Duration;

    fn sample_trace() -> SyntheticTrace {
        let seed = Seed::at(1_700_003_200, "wire-test");
        construct_trace(&seed)
    }

    #[test]
    fn wire_round_trip_preserves_canonical_trace() {
        let trace = sample_trace();
        let payload = WireTraceData::from_batches(&trace.batches);
        let json = serde_json::to_string(&payload).unwrap();
        let decoded: WireTraceData = serde_json::from_str(&json).unwrap();
        let mut rebuilt = decoded.into_trace(trace.trace_id).unwrap();
        let mut expected = trace.clone();
        canonicalize(&mut expected);
        canonicalize(&mut rebuilt);
        assert_eq!(expected, rebuilt);
    }

    #[test]
    fn root_spans_omit_parent_on_the_wire() {
        let trace = sample_trace();
        let payload = WireTraceData::from_batches(&trace.batches);
        let json = serde_json::to_string(&payload).unwrap();
        // exactly one root span, and roots serialize without a parent field
        assert_eq!(json.matches("\"spanId\"").count(), trace.span_count());
        assert_eq!(
            json.matches("\"parentSpanId\"").count(),
            trace.span_count() - 1
        );
    }

    #[test]
    fn timestamps_are_string_encoded() {
        let trace = sample_trace();
        let payload = WireTraceData::from_batches(&trace.batches);
        let value = serde_json::to_value(&payload).unwrap();
        let span = &value["resourceSpans"][0]["scopeSpans"][0]["spans"][0];
        assert!(span["startTimeUnixNano"].is_string());
        assert!(span["endTimeUnixNano"].is_string());
    }

    #[test]
    fn search_response_decodes_trace_ids() {
        let body = r#"{"traces":[{"traceID":"2f3e0cee77ae5dc9c17ade3689eb2e54"},{"traceID":"deadbeef"}]}"#;
        let parsed: WireSearchResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.traces.len(), 2);
        assert_eq!(parsed.traces[1].trace_id, "deadbeef");
        assert_eq!(parsed.traces[0].span_count(), None);
    }

    #[test]
    fn span_sets_yield_matched_span_counts() {
        let body = r#"{"traces":[
            {"traceID":"aa","spanSets":[{"spans":[{},{}],"matched":2},{"spans":[{}]}]},
            {"traceID":"bb","spanSet":{"spans":[{},{},{}]}},
            {"traceID":"cc"}
        ]}"#;
        let parsed: WireSearchResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.traces[0].span_count(), Some(3));
        assert_eq!(parsed.traces[1].span_count(), Some(3));
        assert_eq!(parsed.traces[2].span_count(), None);
    }

    #[test]
    fn auth_token_enables_basic_credentials() {
        let backend = HttpBackend::new("http://push.example", "http://query.example")
            .unwrap()
            .with_auth_token("s3cret");
        assert_eq!(backend.auth_token.as_deref(), Some("s3cret"));

        let bare = HttpBackend::new("http://push.example", "http://query.example").unwrap();
        assert!(bare.auth_token.is_none());
    }

    #[test]
    fn empty_search_response_is_no_matches() {
        let parsed: WireSearchResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.traces.is_empty());
    }

    #[test]
    fn malformed_span_ids_are_rejected() {
        let wire = WireSpan {
            trace_id: "not-hex".to_owned(),
            span_id: "0102030405060708".to_owned(),
            parent_span_id: String::new(),
            name: "get".to_owned(),
            start_time_unix_nano: "0".to_owned(),
            end_time_unix_nano: "0".to_owned(),
            attributes: Vec::new(),
            events: Vec::new(),
        };
        assert!(matches!(wire.into_span(), Err(QueryError::Malformed(_))));
    }

    #[test]
    fn rejects_bad_endpoints() {
        assert!(matches!(
            HttpBackend::new("not a url", "http://localhost:3200"),
            Err(HttpClientError::InvalidEndpoint(..))
        ));
    }

    #[test]
    fn durations_survive_nano_encoding() {
        let trace = sample_trace();
        let span = trace.spans().next().unwrap();
        let wire = WireSpan::from_span(span);
        let back = wire.into_span().unwrap();
        assert_eq!(back.start_time, span.start_time);
        assert_eq!(back.duration, span.duration);
        assert_eq!(
            back.duration,
            Duration::from_nanos(span.duration.as_nanos() as u64)
        );
    }
}

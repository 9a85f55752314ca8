//! Trace builders for tests and benchmarks.
//!
//! Enabled for downstream crates via the `test-util` feature.

use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{span, ResourceSpans, ScopeSpans, Span, Status};
use rand::RngCore;

use crate::Trace;

/// A random 16-byte trace ID.
pub fn random_trace_id() -> Vec<u8> {
    let mut id = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Pad or generate a canonical 16-byte trace ID from the given prefix.
pub fn valid_trace_id(prefix: &[u8]) -> Vec<u8> {
    if prefix.is_empty() {
        return random_trace_id();
    }
    let mut id = prefix.to_vec();
    id.resize(16, 0);
    id
}

/// A span with a random span ID belonging to the given trace, stamped
/// around the current wall-clock time.
pub fn make_span(trace_id: &[u8]) -> Span {
    let mut span_id = vec![0u8; 8];
    rand::thread_rng().fill_bytes(&mut span_id);

    let now_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default();
    let start = now_nanos + u64::from(rand::thread_rng().next_u32() % 1_000_000);
    Span {
        trace_id: trace_id.to_vec(),
        span_id,
        name: "test-span".to_owned(),
        kind: span::SpanKind::Server as i32,
        start_time_unix_nano: start,
        end_time_unix_nano: start + 1_000_000,
        status: Some(Status::default()),
        ..Default::default()
    }
}

/// A single `ResourceSpans` batch holding `spans` random spans.
pub fn make_batch(spans: usize, trace_id: &[u8]) -> ResourceSpans {
    ResourceSpans {
        resource: Some(Resource {
            attributes: vec![KeyValue {
                key: "service.name".to_owned(),
                value: Some(AnyValue {
                    value: Some(any_value::Value::StringValue("test-service".to_owned())),
                }),
            }],
            ..Default::default()
        }),
        scope_spans: vec![ScopeSpans {
            spans: (0..spans).map(|_| make_span(trace_id)).collect(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// A one-batch trace holding `spans` random spans.
pub fn make_trace(spans: usize, trace_id: &[u8]) -> Trace {
    Trace::new(vec![make_batch(spans, trace_id)])
}

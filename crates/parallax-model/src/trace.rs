//! The in-memory trace representation.
//!
//! A trace is a collection of OTLP `ResourceSpans` batches sharing a trace
//! ID. Batches arrive independently (one per push, often one per reporting
//! process) and are only stitched together at read time, so the container is
//! deliberately a flat list rather than a span tree.

use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, Span, TracesData};
use prost::Message;

use crate::ModelError;

/// A single trace: the span batches accumulated for one trace ID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    /// The OTLP resource-span batches making up this trace.
    pub batches: Vec<ResourceSpans>,
}

impl Trace {
    /// Create a trace from a list of batches.
    pub fn new(batches: Vec<ResourceSpans>) -> Self {
        Self { batches }
    }

    /// Total number of spans across all batches.
    pub fn span_count(&self) -> usize {
        self.batches
            .iter()
            .flat_map(|b| &b.scope_spans)
            .map(|s| s.spans.len())
            .sum()
    }

    /// Whether the trace holds no spans at all.
    pub fn is_empty(&self) -> bool {
        self.span_count() == 0
    }

    /// Encode to protobuf bytes (an OTLP `TracesData` message).
    pub fn encode(&self) -> Vec<u8> {
        TracesData {
            resource_spans: self.batches.clone(),
        }
        .encode_to_vec()
    }

    /// Decode from protobuf bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ModelError> {
        let data = TracesData::decode(bytes)?;
        Ok(Self {
            batches: data.resource_spans,
        })
    }

    /// Sort batches, scopes, and spans into a canonical order.
    ///
    /// Two traces holding the same spans normalise to equal values, which is
    /// what lets the combiner and tests compare traces structurally even
    /// though batches arrive in arbitrary order.
    pub fn normalise(&mut self) {
        for batch in &mut self.batches {
            for scope in &mut batch.scope_spans {
                scope.spans.sort_by(|a, b| span_key(a).cmp(&span_key(b)));
            }
            batch
                .scope_spans
                .sort_by(|a, b| scope_key(a).cmp(&scope_key(b)));
        }
        self.batches
            .sort_by(|a, b| batch_key(a).cmp(&batch_key(b)));
    }

    /// The `[min start, max end]` window over all spans, in unix seconds.
    ///
    /// Returns `None` for a trace with no spans.
    pub fn span_range_secs(&self) -> Option<(u32, u32)> {
        let mut range: Option<(u32, u32)> = None;
        for span in self.spans() {
            let start = nanos_to_secs(span.start_time_unix_nano);
            let end = nanos_to_secs(span.end_time_unix_nano);
            range = Some(match range {
                Some((s, e)) => (s.min(start), e.max(end)),
                None => (start, end),
            });
        }
        range
    }

    /// Iterate over every span in the trace.
    pub fn spans(&self) -> impl Iterator<Item = &Span> {
        self.batches
            .iter()
            .flat_map(|b| &b.scope_spans)
            .flat_map(|s| &s.spans)
    }
}

fn nanos_to_secs(nanos: u64) -> u32 {
    u32::try_from(nanos / 1_000_000_000).unwrap_or(u32::MAX)
}

fn span_key(span: &Span) -> (u64, &[u8]) {
    (span.start_time_unix_nano, &span.span_id)
}

fn scope_key(
    scope: &opentelemetry_proto::tonic::trace::v1::ScopeSpans,
) -> (Option<&str>, Option<(u64, &[u8])>) {
    let name = scope.scope.as_ref().map(|s| s.name.as_str());
    (name, scope.spans.first().map(span_key))
}

fn batch_key(batch: &ResourceSpans) -> Option<(u64, &[u8])> {
    batch
        .scope_spans
        .iter()
        .flat_map(|s| &s.spans)
        .map(span_key)
        .min()
}

//! Operational metrics for the ingestion engine.
//!
//! Emitted through the `metrics` facade; the host process decides on the
//! exporter.

use metrics::{counter, gauge};

/// Gauge: live traces currently held in memory, per tenant.
pub const METRIC_LIVE_TRACES: &str = "parallax.ingester.live_traces";

/// Counter: payload bytes received, per tenant.
pub const METRIC_BYTES_RECEIVED: &str = "parallax.ingester.bytes_received";

/// Counter: blocks flushed to the backend, per tenant.
pub const METRIC_BLOCKS_FLUSHED: &str = "parallax.ingester.blocks_flushed";

/// Counter: warnings, per tenant and reason.
pub const METRIC_WARNINGS: &str = "parallax.ingester.warnings";

/// Warning reason: record timestamps outside the ingestion slack window.
pub const REASON_OUTSIDE_INGESTION_SLACK: &str = "outside_ingestion_slack";

/// Warning reason: WAL replay recovered a truncated trailing record.
pub const REASON_WAL_REPLAY_TRUNCATED: &str = "wal_replay_truncated";

pub(crate) fn set_live_traces(tenant: &str, count: usize) {
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    gauge!(METRIC_LIVE_TRACES, "tenant" => tenant.to_owned()).set(count as f64);
}

pub(crate) fn add_bytes_received(tenant: &str, bytes: usize) {
    counter!(METRIC_BYTES_RECEIVED, "tenant" => tenant.to_owned()).increment(bytes as u64);
}

pub(crate) fn inc_blocks_flushed(tenant: &str) {
    counter!(METRIC_BLOCKS_FLUSHED, "tenant" => tenant.to_owned()).increment(1);
}

pub(crate) fn inc_warning(tenant: &str, reason: &'static str) {
    counter!(METRIC_WARNINGS, "tenant" => tenant.to_owned(), "reason" => reason).increment(1);
}

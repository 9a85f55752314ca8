//! Trace data model for the parallax tracing backend.
//!
//! This crate defines the tenant-independent representation of a trace and
//! the codecs that move traces on and off disk:
//!
//! - [`Trace`] wraps OTLP `ResourceSpans` batches, the unit in which spans
//!   arrive from instrumented applications.
//! - [`SegmentCodec`] encodes traces into the framed segment format appended
//!   to write-ahead blocks, and decodes stored bytes back for the read path.
//! - [`combine`] merges two traces sharing an ID into one, deduplicating
//!   spans so the merge is idempotent.

pub mod combine;
pub mod error;
pub mod segment;
pub mod trace;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use combine::{combine, combine_all};
pub use error::ModelError;
pub use segment::{DataEncoding, SegmentCodec};
pub use trace::Trace;

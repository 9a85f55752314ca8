//! Error types for the ingestion engine.
//!
//! Admission failures (`LiveTracesExceeded`, `TraceTooLarge`,
//! `RequestTooLarge`) are surfaced to the caller verbatim and never retried
//! internally. Background failures (block builds, backend writes) are logged
//! and retried by the host; they never take an instance down.

use std::io;

use uuid::Uuid;

/// Errors that can occur in the ingestion pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The tenant is at its live-trace limit; the new trace was not admitted.
    #[error("max live traces exceeded for tenant {tenant}: limit {limit}")]
    LiveTracesExceeded {
        /// Tenant that hit the limit.
        tenant: String,
        /// The per-instance local limit that was hit.
        limit: usize,
    },

    /// The trace has exceeded its byte limit and the ID is poisoned until
    /// the next head-block cut.
    #[error(
        "trace {trace_id} for tenant {tenant} is too large: \
         limit {max} bytes, rejected push of {offending} bytes"
    )]
    TraceTooLarge {
        /// Hex-encoded trace ID.
        trace_id: String,
        /// Tenant owning the trace.
        tenant: String,
        /// The configured per-trace byte limit.
        max: usize,
        /// Size of the rejected push.
        offending: usize,
    },

    /// The bulk push exceeds the per-request byte limit; nothing was applied.
    #[error("request too large: {size} bytes exceeds limit of {limit}")]
    RequestTooLarge {
        /// Total payload size of the request.
        size: usize,
        /// Maximum allowed request size.
        limit: usize,
    },

    /// The push request's parallel arrays disagree.
    #[error("malformed push request: {0}")]
    MalformedRequest(String),

    /// Append was attempted on a block that has already been sealed.
    #[error("append to sealed wal block {block_id}")]
    AppendToSealed {
        /// The sealed block.
        block_id: Uuid,
    },

    /// The block ID names no block in the expected lifecycle state.
    #[error("no block {block_id} in state {state}")]
    BlockNotFound {
        /// The missing block.
        block_id: Uuid,
        /// Lifecycle state that was searched.
        state: &'static str,
    },

    /// Rebuilding a completing block into its final form failed. The
    /// completing block is retained for retry.
    #[error("building block {block_id}: {source}")]
    BlockBuild {
        /// The block that failed to build.
        block_id: Uuid,
        /// Underlying failure.
        source: Box<IngestError>,
    },

    /// A WAL file is damaged beyond a truncated trailing record.
    #[error("wal file {path} is corrupt: {reason}")]
    WalCorrupt {
        /// Path of the damaged file.
        path: String,
        /// What was found.
        reason: String,
    },

    /// A WAL filename does not follow the block filename grammar.
    #[error("unable to parse wal filename {name}: {reason}")]
    MalformedFilename {
        /// The offending filename.
        name: String,
        /// Which part of the grammar it violates.
        reason: String,
    },

    /// Trace payload encode/decode failure.
    #[error(transparent)]
    Model(#[from] parallax_model::ModelError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encoding error.
    #[error("JSON encode error: {source}")]
    JsonEncode {
        /// Underlying serde failure.
        source: serde_json::Error,
    },

    /// Object store error (boxed - large type).
    #[error("object store error: {0}")]
    ObjectStore(Box<object_store::Error>),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
}

impl IngestError {
    /// Build a `TraceTooLarge` error from a raw trace ID.
    pub fn trace_too_large(trace_id: &[u8], tenant: &str, max: usize, offending: usize) -> Self {
        Self::TraceTooLarge {
            trace_id: hex(trace_id),
            tenant: tenant.to_owned(),
            max,
            offending,
        }
    }
}

impl From<object_store::Error> for IngestError {
    fn from(err: object_store::Error) -> Self {
        Self::ObjectStore(Box::new(err))
    }
}

/// Lowercase hex rendering of an opaque ID for logs and error messages.
pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        },
    )
}

//! Error types for the model crate.

use crate::segment::DataEncoding;

/// Errors raised while encoding or decoding trace payloads.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// The byte slice is shorter than the fixed segment header.
    #[error("segment truncated: {len} bytes is shorter than the segment header")]
    TruncatedSegment {
        /// Length of the offending slice.
        len: usize,
    },

    /// Protobuf decoding failed.
    #[error("protobuf decode error: {source}")]
    Decode {
        #[from]
        source: prost::DecodeError,
    },

    /// The encoding token is not one this build understands.
    #[error("unknown data encoding {0:?}")]
    UnknownEncoding(String),

    /// The operation is not supported by the given data encoding.
    #[error("operation unsupported by data encoding {0}")]
    Unsupported(DataEncoding),

    /// A segment merge was asked to combine zero segments.
    #[error("cannot merge an empty set of segments")]
    EmptySegmentSet,
}

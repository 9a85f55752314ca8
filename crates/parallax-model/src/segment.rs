//! The segment codec: the wire form in which traces land on disk.
//!
//! A segment is `start (u32 LE) | end (u32 LE) | protobuf`, where start and
//! end are unix-epoch seconds bounding the spans inside. Prepending the
//! window lets write-ahead replay recover block time ranges without paying
//! for a full protobuf decode per record.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{combine_all, ModelError, Trace};

/// Length of the fixed `start | end` segment header.
pub const SEGMENT_HEADER_LEN: usize = 8;

/// Versioned token naming the payload encoding inside a segment.
///
/// The token travels in block filenames and block metadata, so parsing is
/// strict: an unknown token is an error, never a fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEncoding {
    /// OTLP `TracesData` protobuf with the prepended time window.
    #[default]
    V1,
}

impl DataEncoding {
    /// The canonical string token.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "v1",
        }
    }
}

impl fmt::Display for DataEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DataEncoding {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1" => Ok(Self::V1),
            other => Err(ModelError::UnknownEncoding(other.to_owned())),
        }
    }
}

/// Encodes and decodes trace segments for one [`DataEncoding`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentCodec {
    encoding: DataEncoding,
}

impl SegmentCodec {
    /// Create a codec for the given encoding.
    pub const fn new(encoding: DataEncoding) -> Self {
        Self { encoding }
    }

    /// The encoding this codec speaks.
    pub const fn encoding(&self) -> DataEncoding {
        self.encoding
    }

    /// Encode a trace into segment bytes carrying the `[start, end]` window.
    pub fn prepare_for_write(&self, trace: &Trace, start: u32, end: u32) -> Vec<u8> {
        let proto = trace.encode();
        let mut out = Vec::with_capacity(SEGMENT_HEADER_LEN + proto.len());
        out.extend_from_slice(&start.to_le_bytes());
        out.extend_from_slice(&end.to_le_bytes());
        out.extend_from_slice(&proto);
        out
    }

    /// Decode stored segment bytes back into a trace.
    pub fn prepare_for_read(&self, bytes: &[u8]) -> Result<Trace, ModelError> {
        if bytes.len() < SEGMENT_HEADER_LEN {
            return Err(ModelError::TruncatedSegment { len: bytes.len() });
        }
        Trace::decode(&bytes[SEGMENT_HEADER_LEN..])
    }

    /// Read the `[start, end]` window of a segment without decoding it.
    pub fn fast_range(&self, bytes: &[u8]) -> Result<(u32, u32), ModelError> {
        if bytes.len() < SEGMENT_HEADER_LEN {
            return Err(ModelError::TruncatedSegment { len: bytes.len() });
        }
        let start = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let end = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok((start, end))
    }

    /// Merge several segments of the same trace into one segment.
    ///
    /// Used when a live trace that accumulated multiple pushed segments is
    /// cut to the head block. Segments are merged in lexicographic byte
    /// order, so repeated cuts of the same content produce identical output.
    /// The resulting window is the union of the input windows.
    pub fn merge_segments(&self, mut segments: Vec<Vec<u8>>) -> Result<Vec<u8>, ModelError> {
        match segments.len() {
            0 => return Err(ModelError::EmptySegmentSet),
            1 => return Ok(segments.swap_remove(0)),
            _ => {}
        }

        segments.sort_unstable();

        let mut start = u32::MAX;
        let mut end = 0u32;
        let mut traces = Vec::with_capacity(segments.len());
        for segment in &segments {
            let (s, e) = self.fast_range(segment)?;
            start = start.min(s);
            end = end.max(e);
            traces.push(self.prepare_for_read(segment)?);
        }

        let combined = combine_all(traces).unwrap_or_default();
        Ok(self.prepare_for_write(&combined, start, end))
    }
}

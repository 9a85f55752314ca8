//! The write-ahead log: the on-disk home of head and completing blocks.
//!
//! Each block is a single append-only file of length-prefixed
//! `(trace_id, payload)` frames, named
//! `blockID:tenantID:version:encoding[:dataEncoding]`. The [`Wal`] manages
//! the directory: it creates fresh head blocks and replays whatever files
//! survive a restart, quarantining anything it cannot parse.

pub mod append_block;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use parallax_model::DataEncoding;

use crate::IngestError;

pub use append_block::AppendBlock;

/// The literal WAL format version token carried in block filenames.
pub const VERSION: &str = "v2";

/// Frame header: trace-ID length and payload length, both `u32` LE.
pub(crate) const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on trace-ID length; anything larger marks corruption.
pub(crate) const MAX_ID_LEN: u32 = 128;

/// Upper bound on a single frame payload; anything larger marks corruption.
pub(crate) const MAX_PAYLOAD_LEN: u32 = 1 << 30;

/// Longest accepted data-encoding token in a filename.
const MAX_DATA_ENCODING_LEN: usize = 32;

/// Block-level compression applied to frame payloads.
///
/// Only `none` is written today; the filename grammar keeps the field so the
/// format can evolve without renaming files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// No compression.
    #[default]
    None,
}

impl Encoding {
    /// The canonical string token.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            other => Err(format!("unknown encoding {other:?}")),
        }
    }
}

/// Location of one appended object inside a block file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Full trace ID of the object.
    pub trace_id: Vec<u8>,
    /// Byte offset of the frame start.
    pub offset: u64,
    /// Whole frame length in bytes.
    pub len: u32,
}

/// A block filename decomposed into its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilename {
    /// Globally unique block ID.
    pub block_id: Uuid,
    /// Owning tenant.
    pub tenant: String,
    /// Payload compression.
    pub encoding: Encoding,
    /// Payload data encoding.
    pub data_encoding: DataEncoding,
}

/// Render the canonical block filename.
pub fn format_filename(
    block_id: Uuid,
    tenant: &str,
    encoding: Encoding,
    data_encoding: DataEncoding,
) -> String {
    format!("{block_id}:{tenant}:{VERSION}:{encoding}:{data_encoding}")
}

/// Parse a block filename, strictly.
///
/// The grammar is `blockID:tenantID:version:encoding[:dataEncoding]`: four
/// or five colon-separated fields, the version token matching [`VERSION`]
/// exactly, and a data-encoding token of at most 32 characters. A four-field
/// name carries the default data encoding.
pub fn parse_filename(name: &str) -> Result<ParsedFilename, IngestError> {
    let malformed = |reason: &str| IngestError::MalformedFilename {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };

    let splits: Vec<&str> = name.split(':').collect();
    if splits.len() != 4 && splits.len() != 5 {
        return Err(malformed("unexpected number of segments"));
    }

    let block_id = Uuid::parse_str(splits[0]).map_err(|e| malformed(&format!("bad uuid: {e}")))?;

    let tenant = splits[1];
    if tenant.is_empty() {
        return Err(malformed("missing tenant"));
    }

    if splits[2] != VERSION {
        return Err(malformed("unexpected version token"));
    }

    let encoding = splits[3]
        .parse::<Encoding>()
        .map_err(|e| malformed(&e))?;

    let data_encoding = if splits.len() == 5 {
        if splits[4].chars().count() > MAX_DATA_ENCODING_LEN {
            return Err(malformed("data encoding too long"));
        }
        splits[4]
            .parse::<DataEncoding>()
            .map_err(|e| malformed(&e.to_string()))?
    } else {
        DataEncoding::default()
    };

    Ok(ParsedFilename {
        block_id,
        tenant: tenant.to_owned(),
        encoding,
        data_encoding,
    })
}

/// Encode one `(trace_id, payload)` frame.
pub(crate) fn encode_frame(trace_id: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + trace_id.len() + payload.len());
    out.extend_from_slice(&(trace_id.len() as u32).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(trace_id);
    out.extend_from_slice(payload);
    out
}

/// Split a whole frame back into `(trace_id, payload)`.
pub(crate) fn decode_frame(frame: &[u8]) -> Result<(&[u8], &[u8]), String> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(format!("frame of {} bytes has no header", frame.len()));
    }
    let id_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let payload_len = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
    let expected = FRAME_HEADER_LEN + id_len + payload_len;
    if frame.len() != expected {
        return Err(format!(
            "frame length {} does not match header ({expected} expected)",
            frame.len()
        ));
    }
    let id = &frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + id_len];
    let payload = &frame[FRAME_HEADER_LEN + id_len..];
    Ok((id, payload))
}

/// Outcome of trying to fill a buffer from a sequential reader.
pub(crate) enum ReadOutcome {
    /// The buffer was filled.
    Full,
    /// The reader was already at EOF; nothing was read.
    Empty,
    /// EOF hit partway through the buffer.
    Partial(usize),
}

/// Read exactly `buf.len()` bytes, reporting clean-EOF and truncation
/// separately so replay can tell "end of log" from "torn record".
pub(crate) async fn try_read_exact<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Empty
            } else {
                ReadOutcome::Partial(filled)
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

/// Current wall-clock time as unix-epoch seconds.
pub(crate) fn unix_now() -> u32 {
    u32::try_from(Utc::now().timestamp()).unwrap_or(u32::MAX)
}

/// A block recovered from disk at startup.
pub struct ReplayedBlock {
    /// Tenant the block belongs to.
    pub tenant: String,
    /// The recovered block, sealed and ready to be completed.
    pub block: AppendBlock,
    /// Present when replay tolerated a truncated trailing record.
    pub warning: Option<String>,
}

/// The write-ahead log directory for all tenants of one process.
#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    encoding: Encoding,
    data_encoding: DataEncoding,
    ingestion_slack: Duration,
}

impl Wal {
    /// Open (creating if needed) the WAL directory.
    pub async fn new(
        dir: impl Into<PathBuf>,
        encoding: Encoding,
        data_encoding: DataEncoding,
        ingestion_slack: Duration,
    ) -> Result<Self, IngestError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            encoding,
            data_encoding,
            ingestion_slack,
        })
    }

    /// The WAL directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The data encoding written into new blocks.
    pub fn data_encoding(&self) -> DataEncoding {
        self.data_encoding
    }

    /// Create a fresh, empty head block for a tenant.
    pub async fn new_block(&self, block_id: Uuid, tenant: &str) -> Result<AppendBlock, IngestError> {
        AppendBlock::create(
            &self.dir,
            block_id,
            tenant,
            self.encoding,
            self.data_encoding,
            self.ingestion_slack,
        )
        .await
    }

    /// Replay every block file in the directory.
    ///
    /// Files that fail to parse or are corrupt beyond a truncated trailing
    /// record are quarantined (renamed aside with a `.corrupt` suffix) and
    /// logged; replay continues with the rest. `extra_start_slack` widens
    /// the accepted start-time window to account for data that aged while
    /// the process was down.
    pub async fn replay_all(
        &self,
        extra_start_slack: Duration,
    ) -> Result<Vec<ReplayedBlock>, IngestError> {
        let mut blocks = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name.ends_with(".corrupt") {
                continue;
            }

            match AppendBlock::replay(&self.dir, &name, self.ingestion_slack, extra_start_slack)
                .await
            {
                Ok((block, warning)) => {
                    if let Some(ref w) = warning {
                        tracing::warn!(file = %name, warning = %w, "wal replay recovered with warning");
                        crate::metrics::inc_warning(
                            block.tenant(),
                            crate::metrics::REASON_WAL_REPLAY_TRUNCATED,
                        );
                    }
                    blocks.push(ReplayedBlock {
                        tenant: block.tenant().to_owned(),
                        block,
                        warning,
                    });
                }
                Err(e) => {
                    let quarantined = self.dir.join(format!("{name}.corrupt"));
                    tracing::error!(
                        file = %name,
                        error = %e,
                        "quarantining unreadable wal block"
                    );
                    tokio::fs::rename(self.dir.join(&name), &quarantined).await?;
                }
            }
        }

        Ok(blocks)
    }
}

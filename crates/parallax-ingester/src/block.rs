//! Complete blocks: the final, immutable, indexed form of cut data.
//!
//! A completing WAL block is rebuilt through [`DedupingIter`] into a block
//! directory `{blocks}/{tenant}/{block_id}/` holding three files:
//!
//! - `data` — frames sorted by trace ID, one per distinct ID
//! - `index` — binary index of `(trace_id, offset, len)` entries
//! - `meta.json` — the [`BlockMeta`]
//!
//! Complete blocks serve reads until they have been flushed to the backend
//! and aged past the local retention window, at which point they are
//! deleted.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use parallax_model::{DataEncoding, SegmentCodec, Trace};

use crate::wal::{decode_frame, encode_frame, AppendBlock, Encoding, Record};
use crate::IngestError;

/// Data file name inside a block directory.
pub const DATA_FILE: &str = "data";
/// Index file name inside a block directory.
pub const INDEX_FILE: &str = "index";
/// Metadata file name inside a block directory.
pub const META_FILE: &str = "meta.json";

/// Metadata describing one block, in either lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Globally unique block ID.
    pub block_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Block format version.
    pub version: String,
    /// Payload compression.
    pub encoding: Encoding,
    /// Payload data encoding.
    pub data_encoding: DataEncoding,
    /// Number of stored objects.
    pub total_objects: usize,
    /// Bytes of frame data.
    pub data_length: u64,
    /// Earliest record start.
    pub start_time: DateTime<Utc>,
    /// Latest record end.
    pub end_time: DateTime<Utc>,
}

impl BlockMeta {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        block_id: Uuid,
        tenant_id: &str,
        version: &str,
        encoding: Encoding,
        data_encoding: DataEncoding,
        total_objects: usize,
        data_length: u64,
        start: u32,
        end: u32,
    ) -> Self {
        Self {
            block_id,
            tenant_id: tenant_id.to_owned(),
            version: version.to_owned(),
            encoding,
            data_encoding,
            total_objects,
            data_length,
            start_time: datetime_from_unix(start),
            end_time: datetime_from_unix(end),
        }
    }
}

fn datetime_from_unix(secs: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(secs), 0).unwrap_or_default()
}

/// Iterates a sealed WAL block in trace-ID order, merging every run of
/// records that share an ID into a single object.
///
/// The output satisfies the block invariant: at most one record per trace
/// ID.
pub(crate) struct DedupingIter<'a> {
    block: &'a AppendBlock,
    codec: SegmentCodec,
    records: Vec<Record>,
    pos: usize,
    file: File,
}

impl<'a> DedupingIter<'a> {
    pub(crate) async fn new(block: &'a AppendBlock) -> Result<Self, IngestError> {
        Ok(Self {
            block,
            codec: block.codec(),
            records: block.sorted_records().await,
            pos: 0,
            file: block.open_reader().await?,
        })
    }

    /// The next `(trace_id, merged payload)` pair, or `None` when drained.
    pub(crate) async fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, IngestError> {
        if self.pos >= self.records.len() {
            return Ok(None);
        }

        let trace_id = self.records[self.pos].trace_id.clone();
        let mut payloads = Vec::new();
        while self.pos < self.records.len() && self.records[self.pos].trace_id == trace_id {
            let record = self.records[self.pos].clone();
            payloads.push(self.block.read_payload(&mut self.file, &record).await?);
            self.pos += 1;
        }

        let payload = if payloads.len() == 1 {
            payloads.into_iter().next().expect("one payload")
        } else {
            self.codec.merge_segments(payloads)?
        };
        Ok(Some((trace_id, payload)))
    }
}

/// Rebuild a sealed WAL block into a complete block under `blocks_dir`.
pub(crate) async fn build_from_wal(
    wal_block: &AppendBlock,
    blocks_dir: &Path,
) -> Result<CompleteBlock, IngestError> {
    let wal_meta = wal_block.meta().await;
    let dir = blocks_dir
        .join(&wal_meta.tenant_id)
        .join(wal_meta.block_id.to_string());
    tokio::fs::create_dir_all(&dir).await?;

    let mut iter = DedupingIter::new(wal_block).await?;
    let mut data = File::create(dir.join(DATA_FILE)).await?;
    let mut records: Vec<Record> = Vec::new();
    let mut offset = 0u64;

    while let Some((trace_id, payload)) = iter.next().await? {
        let frame = encode_frame(&trace_id, &payload);
        data.write_all(&frame).await?;
        records.push(Record {
            trace_id,
            offset,
            len: frame.len() as u32,
        });
        offset += frame.len() as u64;
    }
    data.sync_all().await?;

    let mut index = File::create(dir.join(INDEX_FILE)).await?;
    index.write_all(&encode_index(&records)).await?;
    index.sync_all().await?;

    let meta = BlockMeta {
        total_objects: records.len(),
        data_length: offset,
        ..wal_meta
    };
    let mut meta_file = File::create(dir.join(META_FILE)).await?;
    meta_file
        .write_all(
            &serde_json::to_vec_pretty(&meta)
                .map_err(|e| IngestError::JsonEncode { source: e })?,
        )
        .await?;
    meta_file.sync_all().await?;

    Ok(CompleteBlock::from_parts(meta, records, dir))
}

/// A final immutable block, fully indexed, possibly not yet uploaded.
#[derive(Debug)]
pub struct CompleteBlock {
    meta: BlockMeta,
    /// Sorted by trace ID; one record per ID.
    records: Vec<Record>,
    dir: PathBuf,
    codec: SegmentCodec,
    /// Unix seconds of the successful backend flush; zero while unflushed.
    flushed_at: AtomicI64,
}

impl CompleteBlock {
    fn from_parts(meta: BlockMeta, records: Vec<Record>, dir: PathBuf) -> Self {
        let codec = SegmentCodec::new(meta.data_encoding);
        Self {
            meta,
            records,
            dir,
            codec,
            flushed_at: AtomicI64::new(0),
        }
    }

    /// Reopen a block directory written by an earlier run.
    ///
    /// Rediscovered blocks are treated as unflushed; re-uploading an already
    /// flushed block is harmless.
    pub(crate) async fn open(dir: &Path) -> Result<Self, IngestError> {
        let meta_bytes = tokio::fs::read(dir.join(META_FILE)).await?;
        let meta: BlockMeta = serde_json::from_slice(&meta_bytes).map_err(|e| {
            IngestError::WalCorrupt {
                path: dir.display().to_string(),
                reason: format!("unreadable block meta: {e}"),
            }
        })?;

        let index_bytes = tokio::fs::read(dir.join(INDEX_FILE)).await?;
        let records = decode_index(&index_bytes).map_err(|reason| IngestError::WalCorrupt {
            path: dir.display().to_string(),
            reason,
        })?;

        Ok(Self::from_parts(meta, records, dir.to_path_buf()))
    }

    /// The block's unique ID.
    pub fn block_id(&self) -> Uuid {
        self.meta.block_id
    }

    /// The block's metadata.
    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    /// The local block directory.
    pub fn local_dir(&self) -> &Path {
        &self.dir
    }

    /// The stored records, sorted by trace ID.
    pub(crate) fn records(&self) -> &[Record] {
        &self.records
    }

    /// Find a trace in this block.
    pub async fn find_trace_by_id(&self, trace_id: &[u8]) -> Result<Option<Trace>, IngestError> {
        let Ok(idx) = self
            .records
            .binary_search_by(|r| r.trace_id.as_slice().cmp(trace_id))
        else {
            return Ok(None);
        };
        let record = &self.records[idx];

        let mut file = File::open(self.dir.join(DATA_FILE)).await?;
        file.seek(SeekFrom::Start(record.offset)).await?;
        let mut frame = vec![0u8; record.len as usize];
        file.read_exact(&mut frame).await?;

        let (id, payload) = decode_frame(&frame).map_err(|reason| IngestError::WalCorrupt {
            path: self.dir.display().to_string(),
            reason,
        })?;
        if id != record.trace_id {
            return Err(IngestError::WalCorrupt {
                path: self.dir.display().to_string(),
                reason: format!("record at offset {} holds a different trace", record.offset),
            });
        }
        Ok(Some(self.codec.prepare_for_read(payload)?))
    }

    /// Record the successful backend flush.
    pub fn mark_flushed(&self) {
        self.flushed_at
            .store(Utc::now().timestamp(), Ordering::Release);
    }

    /// When the block was flushed to the backend, if it has been.
    pub fn flushed_at(&self) -> Option<DateTime<Utc>> {
        match self.flushed_at.load(Ordering::Acquire) {
            0 => None,
            secs => DateTime::from_timestamp(secs, 0),
        }
    }

    /// Whether the flush happened at least `timeout` ago.
    pub(crate) fn flushed_longer_than(&self, timeout: Duration) -> bool {
        let Some(flushed) = self.flushed_at() else {
            return false;
        };
        Utc::now()
            .signed_duration_since(flushed)
            .to_std()
            .map(|elapsed| elapsed >= timeout)
            .unwrap_or(false)
    }

    /// Read the whole data file, for upload to the backend.
    pub async fn read_data(&self) -> Result<Vec<u8>, IngestError> {
        Ok(tokio::fs::read(self.dir.join(DATA_FILE)).await?)
    }

    /// Read the whole index file, for upload to the backend.
    pub async fn read_index(&self) -> Result<Vec<u8>, IngestError> {
        Ok(tokio::fs::read(self.dir.join(INDEX_FILE)).await?)
    }

    /// Delete the local block directory. The block must not be used
    /// afterwards.
    pub async fn clear(&self) -> Result<(), IngestError> {
        tokio::fs::remove_dir_all(&self.dir).await?;
        Ok(())
    }
}

fn encode_index(records: &[Record]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(&(record.trace_id.len() as u32).to_le_bytes());
        out.extend_from_slice(&record.trace_id);
        out.extend_from_slice(&record.offset.to_le_bytes());
        out.extend_from_slice(&record.len.to_le_bytes());
    }
    out
}

fn decode_index(bytes: &[u8]) -> Result<Vec<Record>, String> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let need = |n: usize, pos: usize| -> Result<(), String> {
            if pos + n > bytes.len() {
                Err(format!("index entry truncated at byte {pos}"))
            } else {
                Ok(())
            }
        };

        need(4, pos)?;
        let id_len =
            u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
                as usize;
        pos += 4;

        need(id_len + 12, pos)?;
        let trace_id = bytes[pos..pos + id_len].to_vec();
        pos += id_len;

        let mut offset_bytes = [0u8; 8];
        offset_bytes.copy_from_slice(&bytes[pos..pos + 8]);
        pos += 8;
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[pos..pos + 4]);
        pos += 4;

        records.push(Record {
            trace_id,
            offset: u64::from_le_bytes(offset_bytes),
            len: u32::from_le_bytes(len_bytes),
        });
    }
    Ok(records)
}

//! The append block: the single mutable on-disk block receiving cut traces.
//!
//! Objects are written as length-prefixed frames in arrival order; an
//! in-memory index keyed by trace-ID fingerprint makes every appended object
//! discoverable the moment `append` returns. The block is sealed when it is
//! cut, after which it only serves reads until the completer rebuilds it
//! into its final form.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use parallax_model::{combine_all, DataEncoding, ModelError, SegmentCodec, Trace};

use crate::block::BlockMeta;
use crate::live_traces::token_for_trace_id;
use crate::metrics;
use crate::wal::{
    decode_frame, encode_frame, format_filename, parse_filename, try_read_exact, unix_now,
    Encoding, ReadOutcome, Record, FRAME_HEADER_LEN, MAX_ID_LEN, MAX_PAYLOAD_LEN, VERSION,
};
use crate::IngestError;

/// Appender state behind the block's lock: the write handle, the record
/// index, and the running metadata.
#[derive(Debug)]
struct AppendInner {
    /// Write handle; `None` once the block is sealed.
    writer: Option<File>,
    records: Vec<Record>,
    by_token: HashMap<u64, Vec<u32>>,
    data_len: u64,
    /// Earliest record start, unix seconds. Initialised to `u32::MAX` and
    /// tightened by every append.
    start: u32,
    /// Latest record end, unix seconds. Initialised to zero.
    end: u32,
}

/// A write-ahead block holding framed `(trace_id, object)` records.
#[derive(Debug)]
pub struct AppendBlock {
    block_id: Uuid,
    tenant: String,
    path: PathBuf,
    encoding: Encoding,
    data_encoding: DataEncoding,
    codec: SegmentCodec,
    ingestion_slack: Duration,
    inner: Mutex<AppendInner>,
}

impl AppendBlock {
    /// Create a fresh, empty block file in `dir`.
    pub(crate) async fn create(
        dir: &Path,
        block_id: Uuid,
        tenant: &str,
        encoding: Encoding,
        data_encoding: DataEncoding,
        ingestion_slack: Duration,
    ) -> Result<Self, IngestError> {
        let path = dir.join(format_filename(block_id, tenant, encoding, data_encoding));
        let writer = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .await?;

        Ok(Self {
            block_id,
            tenant: tenant.to_owned(),
            path,
            encoding,
            data_encoding,
            codec: SegmentCodec::new(data_encoding),
            ingestion_slack,
            inner: Mutex::new(AppendInner {
                writer: Some(writer),
                records: Vec::new(),
                by_token: HashMap::new(),
                data_len: 0,
                start: u32::MAX,
                end: 0,
            }),
        })
    }

    /// Rebuild a block from an existing file, e.g. after a crash.
    ///
    /// The returned block is sealed: it can be searched and completed but
    /// not appended to. Returns an optional human-readable warning when the
    /// file ended in a truncated record, which is expected after a crash.
    /// Corruption anywhere else is an error and the caller quarantines the
    /// file.
    pub(crate) async fn replay(
        dir: &Path,
        filename: &str,
        ingestion_slack: Duration,
        extra_start_slack: Duration,
    ) -> Result<(Self, Option<String>), IngestError> {
        let parsed = parse_filename(filename)?;
        let path = dir.join(filename);
        let codec = SegmentCodec::new(parsed.data_encoding);

        let file = File::open(&path).await?;
        let mut reader = BufReader::new(file);

        let mut records: Vec<Record> = Vec::new();
        let mut by_token: HashMap<u64, Vec<u32>> = HashMap::new();
        let mut offset = 0u64;
        let mut start = u32::MAX;
        let mut end = 0u32;
        let mut warning = None;

        loop {
            let mut header = [0u8; FRAME_HEADER_LEN];
            match try_read_exact(&mut reader, &mut header).await? {
                ReadOutcome::Empty => break,
                ReadOutcome::Partial(_) => {
                    warning = Some(truncation_warning(&records, offset));
                    break;
                }
                ReadOutcome::Full => {}
            }

            let id_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let payload_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if id_len == 0 || id_len > MAX_ID_LEN || payload_len > MAX_PAYLOAD_LEN {
                return Err(IngestError::WalCorrupt {
                    path: path.display().to_string(),
                    reason: format!(
                        "implausible frame header at offset {offset}: \
                         id_len {id_len}, payload_len {payload_len}"
                    ),
                });
            }

            let mut trace_id = vec![0u8; id_len as usize];
            if !matches!(
                try_read_exact(&mut reader, &mut trace_id).await?,
                ReadOutcome::Full
            ) {
                warning = Some(truncation_warning(&records, offset));
                break;
            }
            let mut payload = vec![0u8; payload_len as usize];
            if !matches!(
                try_read_exact(&mut reader, &mut payload).await?,
                ReadOutcome::Full
            ) {
                warning = Some(truncation_warning(&records, offset));
                break;
            }

            let (record_start, record_end) = match codec.fast_range(&payload) {
                Ok(range) => range,
                Err(ModelError::Unsupported(_)) => {
                    let now = unix_now();
                    (now, now)
                }
                Err(e) => {
                    return Err(IngestError::WalCorrupt {
                        path: path.display().to_string(),
                        reason: format!("unreadable record at offset {offset}: {e}"),
                    })
                }
            };
            let (record_start, record_end) = adjust_range_for_slack(
                &parsed.tenant,
                ingestion_slack,
                extra_start_slack,
                record_start,
                record_end,
            );
            start = start.min(record_start);
            end = end.max(record_end);

            let frame_len = FRAME_HEADER_LEN as u64 + u64::from(id_len) + u64::from(payload_len);
            by_token
                .entry(token_for_trace_id(&trace_id))
                .or_default()
                .push(records.len() as u32);
            records.push(Record {
                trace_id,
                offset,
                len: frame_len as u32,
            });
            offset += frame_len;
        }

        let block = Self {
            block_id: parsed.block_id,
            tenant: parsed.tenant,
            path,
            encoding: parsed.encoding,
            data_encoding: parsed.data_encoding,
            codec,
            ingestion_slack,
            inner: Mutex::new(AppendInner {
                writer: None,
                records,
                by_token,
                data_len: offset,
                start,
                end,
            }),
        };
        Ok((block, warning))
    }

    /// The block's unique ID.
    pub fn block_id(&self) -> Uuid {
        self.block_id
    }

    /// The owning tenant.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Path of the on-disk block file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one object. `start` and `end` are unix-epoch seconds bounding
    /// the spans in the object; values outside the ingestion-slack window
    /// are clamped to now and counted as a warning.
    ///
    /// Once this returns, the bytes have reached OS buffers and the record
    /// is discoverable through [`AppendBlock::find_trace_by_id`].
    pub async fn append(
        &self,
        trace_id: &[u8],
        payload: &[u8],
        start: u32,
        end: u32,
    ) -> Result<(), IngestError> {
        let mut inner = self.inner.lock().await;
        let block_id = self.block_id;
        let writer = inner
            .writer
            .as_mut()
            .ok_or(IngestError::AppendToSealed { block_id })?;

        let frame = encode_frame(trace_id, payload);
        writer.write_all(&frame).await?;

        let (start, end) = adjust_range_for_slack(
            &self.tenant,
            self.ingestion_slack,
            Duration::ZERO,
            start,
            end,
        );

        let offset = inner.data_len;
        let index = inner.records.len() as u32;
        inner
            .by_token
            .entry(token_for_trace_id(trace_id))
            .or_default()
            .push(index);
        inner.records.push(Record {
            trace_id: trace_id.to_vec(),
            offset,
            len: frame.len() as u32,
        });
        inner.data_len += frame.len() as u64;
        inner.start = inner.start.min(start);
        inner.end = inner.end.max(end);
        Ok(())
    }

    /// Bytes written so far.
    pub async fn data_length(&self) -> u64 {
        self.inner.lock().await.data_len
    }

    /// Number of appended objects.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    /// Whether the block holds no objects.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether the block has been sealed.
    pub async fn is_sealed(&self) -> bool {
        self.inner.lock().await.writer.is_none()
    }

    /// Snapshot of the block's metadata.
    pub async fn meta(&self) -> BlockMeta {
        let inner = self.inner.lock().await;
        BlockMeta::new(
            self.block_id,
            &self.tenant,
            VERSION,
            self.encoding,
            self.data_encoding,
            inner.records.len(),
            inner.data_len,
            inner.start,
            inner.end,
        )
    }

    /// Locations of every record for this trace ID.
    pub async fn records_for_id(&self, trace_id: &[u8]) -> Vec<Record> {
        let inner = self.inner.lock().await;
        let Some(indices) = inner.by_token.get(&token_for_trace_id(trace_id)) else {
            return Vec::new();
        };
        indices
            .iter()
            .map(|&i| &inner.records[i as usize])
            .filter(|r| r.trace_id == trace_id)
            .cloned()
            .collect()
    }

    /// Find and combine every occurrence of a trace in this block.
    pub async fn find_trace_by_id(&self, trace_id: &[u8]) -> Result<Option<Trace>, IngestError> {
        let mut records = self.records_for_id(trace_id).await;
        if records.is_empty() {
            return Ok(None);
        }
        records.sort_by_key(|r| r.offset);

        let mut file = self.open_reader().await?;
        let mut traces = Vec::with_capacity(records.len());
        for record in &records {
            let payload = self.read_payload(&mut file, record).await?;
            traces.push(self.codec.prepare_for_read(&payload)?);
        }
        Ok(combine_all(traces))
    }

    /// Seal the block: flush and close the append handle. Appends after
    /// this fail; sealing twice is a no-op.
    pub async fn seal(&self) -> Result<(), IngestError> {
        let mut inner = self.inner.lock().await;
        if let Some(mut writer) = inner.writer.take() {
            writer.flush().await?;
        }
        Ok(())
    }

    /// Delete the block file. The block must not be used afterwards.
    pub async fn clear(&self) -> Result<(), IngestError> {
        {
            let mut inner = self.inner.lock().await;
            inner.writer.take();
        }
        tokio::fs::remove_file(&self.path).await?;
        Ok(())
    }

    /// All records, sorted by trace ID then append order. The ordering
    /// groups duplicate IDs together for the deduplicating block builder.
    pub(crate) async fn sorted_records(&self) -> Vec<Record> {
        let inner = self.inner.lock().await;
        let mut records = inner.records.clone();
        records.sort_by(|a, b| (&a.trace_id, a.offset).cmp(&(&b.trace_id, b.offset)));
        records
    }

    /// Open a fresh read handle on the block file.
    pub(crate) async fn open_reader(&self) -> Result<File, IngestError> {
        Ok(File::open(&self.path).await?)
    }

    /// Read one record's payload through the given handle.
    pub(crate) async fn read_payload(
        &self,
        file: &mut File,
        record: &Record,
    ) -> Result<Vec<u8>, IngestError> {
        file.seek(SeekFrom::Start(record.offset)).await?;
        let mut frame = vec![0u8; record.len as usize];
        file.read_exact(&mut frame).await?;

        let (id, payload) = decode_frame(&frame).map_err(|reason| IngestError::WalCorrupt {
            path: self.path.display().to_string(),
            reason,
        })?;
        if id != record.trace_id {
            return Err(IngestError::WalCorrupt {
                path: self.path.display().to_string(),
                reason: format!("record at offset {} holds a different trace", record.offset),
            });
        }
        Ok(payload.to_vec())
    }

    /// The codec matching this block's data encoding.
    pub(crate) fn codec(&self) -> SegmentCodec {
        self.codec
    }
}

fn truncation_warning(records: &[Record], offset: u64) -> String {
    format!(
        "truncated trailing record at offset {offset}; \
         recovered {} complete records",
        records.len()
    )
}

/// Clamp a record's time range into `[now - slack - extra, now + slack]`.
/// Values outside the window are replaced with now and counted.
fn adjust_range_for_slack(
    tenant: &str,
    slack: Duration,
    extra_start_slack: Duration,
    start: u32,
    end: u32,
) -> (u32, u32) {
    let now = unix_now();
    let start_of_range = now
        .saturating_sub(secs_u32(slack))
        .saturating_sub(secs_u32(extra_start_slack));
    let end_of_range = now.saturating_add(secs_u32(slack));

    let mut warn = false;
    let mut start = start;
    let mut end = end;
    if start < start_of_range {
        warn = true;
        start = now;
    }
    if end > end_of_range {
        warn = true;
        end = now;
    }
    if warn {
        metrics::inc_warning(tenant, metrics::REASON_OUTSIDE_INGESTION_SLACK);
    }
    (start, end)
}

fn secs_u32(d: Duration) -> u32 {
    u32::try_from(d.as_secs()).unwrap_or(u32::MAX)
}

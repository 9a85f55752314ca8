//! The tenant instance: one tenant's slice of the ingestion engine.
//!
//! An instance owns the tenant's live-trace table, the current head block,
//! and the lists of completing and complete blocks, and exposes the push,
//! cut, complete, find, and flush surface the host drives.
//!
//! Locking is split so that pushes never wait on block rebuilds: the
//! live-trace table shards its own locks, the block lists sit behind one
//! `RwLock` that is held only to look up or swap `Arc`s (and to append to
//! the head, which is local disk I/O), and the heavy `complete_block`
//! rebuild runs with no instance lock held at all.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use parallax_model::{combine_all, SegmentCodec, Trace};

use crate::block::{build_from_wal, CompleteBlock};
use crate::limiter::Limiter;
use crate::live_traces::{token_for_trace_id, LiveTraceTable, PushOutcome};
use crate::metrics;
use crate::wal::{AppendBlock, Wal};
use crate::IngestError;

/// A decoded bulk push: three parallel arrays, element `i` forming one
/// `(trace_id, segment, optional search payload)` triple.
#[derive(Debug, Clone, Default)]
pub struct PushRequest {
    /// Trace IDs.
    pub ids: Vec<Vec<u8>>,
    /// Serialised span batches, one per ID.
    pub traces: Vec<Vec<u8>>,
    /// Optional search payloads; empty, or parallel to `ids`.
    pub search_data: Vec<Vec<u8>>,
}

impl PushRequest {
    /// Build a request from parallel ID and payload arrays.
    pub fn new(ids: Vec<Vec<u8>>, traces: Vec<Vec<u8>>) -> Self {
        Self {
            ids,
            traces,
            search_data: Vec::new(),
        }
    }

    /// Total payload bytes in the request.
    pub fn byte_size(&self) -> usize {
        self.traces.iter().map(Vec::len).sum()
    }

    fn validate(&self) -> Result<(), IngestError> {
        if self.ids.len() != self.traces.len() {
            return Err(IngestError::MalformedRequest(format!(
                "{} ids but {} traces",
                self.ids.len(),
                self.traces.len()
            )));
        }
        if !self.search_data.is_empty() && self.search_data.len() != self.ids.len() {
            return Err(IngestError::MalformedRequest(format!(
                "{} ids but {} search payloads",
                self.ids.len(),
                self.search_data.len()
            )));
        }
        Ok(())
    }
}

/// The block lifecycle state: one mutable head, then ordered lists of
/// frozen blocks on their way to the backend.
struct BlockState {
    head: Arc<AppendBlock>,
    completing: Vec<Arc<AppendBlock>>,
    complete: Vec<Arc<CompleteBlock>>,
    last_block_cut: Instant,
}

/// One tenant's ingestion engine instance.
pub struct TenantInstance {
    tenant_id: String,
    codec: SegmentCodec,
    limiter: Arc<Limiter>,
    wal: Arc<Wal>,
    blocks_dir: PathBuf,
    traces: LiveTraceTable,
    /// Trace IDs (by fingerprint) that exceeded the per-trace byte limit.
    /// Pushes keep failing for these until the next head-block cut, even
    /// though the live trace itself has moved on.
    poisoned: Mutex<HashSet<u64>>,
    blocks: RwLock<BlockState>,
}

impl TenantInstance {
    /// Create an instance, opening a fresh head block. Blocks recovered
    /// from a previous run enter the completing and complete lists and are
    /// drained by the normal lifecycle machinery.
    pub(crate) async fn new(
        tenant_id: &str,
        limiter: Arc<Limiter>,
        wal: Arc<Wal>,
        blocks_dir: PathBuf,
        completing: Vec<Arc<AppendBlock>>,
        complete: Vec<Arc<CompleteBlock>>,
    ) -> Result<Self, IngestError> {
        let head = Arc::new(wal.new_block(Uuid::new_v4(), tenant_id).await?);
        let codec = SegmentCodec::new(wal.data_encoding());

        Ok(Self {
            tenant_id: tenant_id.to_owned(),
            codec,
            limiter,
            wal,
            blocks_dir,
            traces: LiveTraceTable::new(),
            poisoned: Mutex::new(HashSet::new()),
            blocks: RwLock::new(BlockState {
                head,
                completing,
                complete,
                last_block_cut: Instant::now(),
            }),
        })
    }

    /// The tenant this instance serves.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Number of live traces currently held in memory.
    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    /// Push one serialised span batch for a trace.
    ///
    /// Admission-checks the tenant's live-trace and per-trace byte limits.
    /// Search payloads are accepted for wire compatibility and discarded;
    /// this engine stores spans only.
    pub async fn push_bytes(
        &self,
        cancel: &CancellationToken,
        trace_id: &[u8],
        batch: Vec<u8>,
        _search_data: Option<Vec<u8>>,
    ) -> Result<(), IngestError> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let size = batch.len();
        metrics::add_bytes_received(&self.tenant_id, size);

        let max_bytes = self.limiter.max_bytes_per_trace(&self.tenant_id);
        let token = token_for_trace_id(trace_id);
        if self.poisoned.lock().await.contains(&token) {
            return Err(IngestError::trace_too_large(
                trace_id,
                &self.tenant_id,
                max_bytes,
                size,
            ));
        }

        let capacity = self.limiter.local_max_traces(&self.tenant_id);
        match self.traces.push(trace_id, batch, max_bytes, capacity) {
            PushOutcome::Appended => Ok(()),
            PushOutcome::WouldExceedSize { .. } => {
                self.poisoned.lock().await.insert(token);
                Err(IngestError::trace_too_large(
                    trace_id,
                    &self.tenant_id,
                    max_bytes,
                    size,
                ))
            }
            PushOutcome::AtCapacity { .. } => Err(IngestError::LiveTracesExceeded {
                tenant: self.tenant_id.clone(),
                limit: capacity,
            }),
        }
    }

    /// Push a bulk request.
    ///
    /// The per-request byte limit is checked before anything is applied; on
    /// violation the whole request is rejected. Otherwise pushes are applied
    /// in order and the first failure is returned, with earlier successful
    /// pushes left in place.
    pub async fn push_bytes_request(
        &self,
        cancel: &CancellationToken,
        request: PushRequest,
    ) -> Result<(), IngestError> {
        request.validate()?;

        let limit = self.limiter.max_bytes_per_request(&self.tenant_id);
        let size = request.byte_size();
        if limit > 0 && size > limit {
            return Err(IngestError::RequestTooLarge { size, limit });
        }

        let PushRequest {
            ids,
            traces,
            mut search_data,
        } = request;
        search_data.resize(ids.len(), Vec::new());

        for ((id, batch), search) in ids.into_iter().zip(traces).zip(search_data) {
            let search = if search.is_empty() { None } else { Some(search) };
            self.push_bytes(cancel, &id, batch, search).await?;
        }
        Ok(())
    }

    /// Cut idle live traces into the head block.
    ///
    /// A trace is cut when `immediate` is set or its last append is older
    /// than `now + cutoff`. Cut traces become visible in the head block and
    /// vanish from the live table; the live-trace gauge is updated after
    /// the cut.
    pub async fn cut_complete_traces(
        &self,
        cutoff: Duration,
        immediate: bool,
    ) -> Result<(), IngestError> {
        let cut = self.traces.cut(cutoff, immediate);

        for trace in cut {
            // A live trace that never received a payload has nothing to write.
            if trace.batches.is_empty() {
                continue;
            }
            let object = self.codec.merge_segments(trace.batches)?;
            let (start, end) = self.codec.fast_range(&object)?;

            let blocks = self.blocks.read().await;
            blocks.head.append(&trace.trace_id, &object, start, end).await?;
        }

        metrics::set_live_traces(&self.tenant_id, self.traces.len());
        Ok(())
    }

    /// Seal the head block and open a fresh one, if the head is ready.
    ///
    /// The head is ready when `immediate` is set, it has outlived
    /// `max_block_lifetime`, or it has grown past `max_block_bytes`. An
    /// empty head is never cut. Returns the sealed block's ID, or `None`.
    pub async fn cut_block_if_ready(
        &self,
        max_block_lifetime: Duration,
        max_block_bytes: u64,
        immediate: bool,
    ) -> Result<Option<Uuid>, IngestError> {
        let mut blocks = self.blocks.write().await;

        let data_len = blocks.head.data_length().await;
        if data_len == 0 {
            return Ok(None);
        }
        let ready = immediate
            || blocks.last_block_cut.elapsed() >= max_block_lifetime
            || data_len >= max_block_bytes;
        if !ready {
            return Ok(None);
        }

        blocks.head.seal().await?;
        let new_head = Arc::new(
            self.wal
                .new_block(Uuid::new_v4(), &self.tenant_id)
                .await?,
        );
        let sealed = std::mem::replace(&mut blocks.head, new_head);
        let sealed_id = sealed.block_id();
        blocks.completing.push(sealed);
        blocks.last_block_cut = Instant::now();
        drop(blocks);

        // The previous head's contents are now frozen on disk, so the
        // too-large verdicts tied to it no longer apply.
        self.poisoned.lock().await.clear();

        tracing::info!(
            tenant = %self.tenant_id,
            block = %sealed_id,
            size = data_len,
            "cut head block"
        );
        Ok(Some(sealed_id))
    }

    /// Rebuild a completing block into its final indexed form.
    ///
    /// Idempotent by block ID: completing an already-complete block is a
    /// no-op. On failure the completing block stays in place for retry.
    pub async fn complete_block(&self, block_id: Uuid) -> Result<(), IngestError> {
        let wal_block = {
            let blocks = self.blocks.read().await;
            if blocks.complete.iter().any(|b| b.block_id() == block_id) {
                return Ok(());
            }
            blocks
                .completing
                .iter()
                .find(|b| b.block_id() == block_id)
                .cloned()
        };
        let Some(wal_block) = wal_block else {
            return Err(IngestError::BlockNotFound {
                block_id,
                state: "completing",
            });
        };

        let complete = build_from_wal(&wal_block, &self.blocks_dir)
            .await
            .map_err(|e| IngestError::BlockBuild {
                block_id,
                source: Box::new(e),
            })?;

        let mut blocks = self.blocks.write().await;
        if !blocks.complete.iter().any(|b| b.block_id() == block_id) {
            blocks.complete.push(Arc::new(complete));
        }

        tracing::info!(tenant = %self.tenant_id, block = %block_id, "completed block");
        Ok(())
    }

    /// Drop a completing block and delete its WAL file. Called once
    /// `complete_block` has durably produced the final block; clearing a
    /// block that is not in the completing list is an error.
    pub async fn clear_completing_block(&self, block_id: Uuid) -> Result<(), IngestError> {
        let removed = {
            let mut blocks = self.blocks.write().await;
            let idx = blocks
                .completing
                .iter()
                .position(|b| b.block_id() == block_id);
            idx.map(|i| blocks.completing.remove(i))
        };
        let Some(block) = removed else {
            return Err(IngestError::BlockNotFound {
                block_id,
                state: "completing",
            });
        };
        block.clear().await
    }

    /// Delete local complete blocks whose backend flush is older than
    /// `complete_block_timeout`. Blocks that have never been flushed are
    /// never cleared.
    pub async fn clear_flushed_blocks(
        &self,
        complete_block_timeout: Duration,
    ) -> Result<(), IngestError> {
        let expired = {
            let mut blocks = self.blocks.write().await;
            let (expired, kept): (Vec<_>, Vec<_>) = blocks
                .complete
                .drain(..)
                .partition(|b| b.flushed_longer_than(complete_block_timeout));
            blocks.complete = kept;
            expired
        };

        for block in expired {
            let block_id = block.block_id();
            block.clear().await?;
            tracing::info!(
                tenant = %self.tenant_id,
                block = %block_id,
                "cleared flushed block"
            );
        }
        Ok(())
    }

    /// Find a trace across every in-flight state and merge all occurrences.
    ///
    /// Searches the live table, the head block, each completing block, and
    /// each complete block; returns `None` only when no occurrence exists
    /// anywhere. Checks for cancellation between stages and between blocks.
    pub async fn find_trace_by_id(
        &self,
        cancel: &CancellationToken,
        trace_id: &[u8],
    ) -> Result<Option<Trace>, IngestError> {
        let mut found: Vec<Trace> = Vec::new();

        if let Some(batches) = self.traces.find(trace_id) {
            for batch in batches {
                found.push(self.codec.prepare_for_read(&batch)?);
            }
        }
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let (head, completing, complete) = {
            let blocks = self.blocks.read().await;
            (
                blocks.head.clone(),
                blocks.completing.clone(),
                blocks.complete.clone(),
            )
        };

        if let Some(trace) = head.find_trace_by_id(trace_id).await? {
            found.push(trace);
        }
        for block in completing {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            if let Some(trace) = block.find_trace_by_id(trace_id).await? {
                found.push(trace);
            }
        }
        for block in complete {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            if let Some(trace) = block.find_trace_by_id(trace_id).await? {
                found.push(trace);
            }
        }

        Ok(combine_all(found))
    }

    /// The complete block with this ID, if it has not yet been flushed.
    /// The flush worker marks it flushed after the backend write succeeds.
    pub async fn get_block_to_be_flushed(&self, block_id: Uuid) -> Option<Arc<CompleteBlock>> {
        let blocks = self.blocks.read().await;
        blocks
            .complete
            .iter()
            .find(|b| b.block_id() == block_id && b.flushed_at().is_none())
            .cloned()
    }

    /// Every complete block that has not been flushed yet.
    pub async fn blocks_to_flush(&self) -> Vec<Arc<CompleteBlock>> {
        let blocks = self.blocks.read().await;
        blocks
            .complete
            .iter()
            .filter(|b| b.flushed_at().is_none())
            .cloned()
            .collect()
    }

    /// IDs of blocks currently in the completing list.
    pub async fn completing_block_ids(&self) -> Vec<Uuid> {
        let blocks = self.blocks.read().await;
        blocks.completing.iter().map(|b| b.block_id()).collect()
    }

    /// Number of blocks in the complete list.
    pub async fn complete_block_count(&self) -> usize {
        self.blocks.read().await.complete.len()
    }

    #[cfg(test)]
    pub(crate) async fn completing_block_count(&self) -> usize {
        self.blocks.read().await.completing.len()
    }

    #[cfg(test)]
    pub(crate) async fn last_block_cut(&self) -> Instant {
        self.blocks.read().await.last_block_cut
    }

    #[cfg(test)]
    pub(crate) fn live_traces(&self) -> &LiveTraceTable {
        &self.traces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    use crate::test_fixtures::{
        default_instance, instance_with_limits, make_request, request_with_byte_limit,
    };
    use crate::config::LimitsConfig;
    use parallax_model::test_util::{make_trace, random_trace_id};

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    /// Walk one block through the full lifecycle, as the host would.
    #[tokio::test]
    async fn basic_roundtrip() {
        let env = default_instance().await;
        let i = &env.instance;

        let (_, request) = make_request(&[]);
        i.push_bytes_request(&cancel(), request).await.unwrap();
        assert_eq!(i.trace_count(), 1);

        i.cut_complete_traces(Duration::ZERO, true).await.unwrap();
        assert_eq!(i.trace_count(), 0);

        let block_id = i
            .cut_block_if_ready(Duration::ZERO, 0, false)
            .await
            .unwrap()
            .expect("head block should have been ready");

        i.complete_block(block_id).await.unwrap();
        assert_eq!(i.completing_block_count().await, 1);
        assert_eq!(i.complete_block_count().await, 1);

        let block = i.get_block_to_be_flushed(block_id).await.unwrap();
        block.mark_flushed(); // stand-in for the backend write

        assert!(i.get_block_to_be_flushed(block_id).await.is_none());

        i.clear_flushed_blocks(Duration::from_secs(30 * 3600))
            .await
            .unwrap();
        assert_eq!(i.complete_block_count().await, 1);

        i.clear_flushed_blocks(Duration::ZERO).await.unwrap();
        assert_eq!(i.complete_block_count().await, 0);
    }

    /// Push ten traces, re-push them across a cut, and verify the combined
    /// trace is found intact at every lifecycle stage.
    #[tokio::test]
    async fn find_across_all_stages() {
        let env = default_instance().await;
        let i = &env.instance;
        let codec = env.codec;

        let mut ids = Vec::new();
        let mut traces = Vec::new();
        for _ in 0..10 {
            let id = random_trace_id();
            let trace = make_trace(10, &id);
            let segment = codec.prepare_for_write(&trace, 0, 0);
            i.push_bytes(&cancel(), &id, segment, None).await.unwrap();
            ids.push(id);
            traces.push(trace);
        }

        async fn query_all(i: &TenantInstance, ids: &[Vec<u8>], traces: &[Trace]) {
            for (id, pushed) in ids.iter().zip(traces) {
                let found = i
                    .find_trace_by_id(&CancellationToken::new(), id)
                    .await
                    .unwrap()
                    .unwrap_or_else(|| panic!("trace {} not found", crate::error::hex(id)));
                let mut expected = pushed.clone();
                expected.normalise();
                assert_eq!(found, expected);
            }
        }

        query_all(i, &ids, &traces).await;

        i.cut_complete_traces(Duration::ZERO, true).await.unwrap();

        // Push every trace again: same IDs now live in both the head block
        // and the live table.
        for (id, trace) in ids.iter().zip(&traces) {
            let segment = codec.prepare_for_write(trace, 0, 0);
            i.push_bytes(&cancel(), id, segment, None).await.unwrap();
        }
        query_all(i, &ids, &traces).await;

        let block_id = i
            .cut_block_if_ready(Duration::ZERO, 0, true)
            .await
            .unwrap()
            .expect("block should cut");
        query_all(i, &ids, &traces).await;

        i.complete_block(block_id).await.unwrap();
        query_all(i, &ids, &traces).await;

        i.clear_completing_block(block_id).await.unwrap();
        query_all(i, &ids, &traces).await;

        let block = i.get_block_to_be_flushed(block_id).await.unwrap();
        block.mark_flushed();
        query_all(i, &ids, &traces).await;
    }

    #[tokio::test]
    async fn max_live_traces_enforced() {
        let env = instance_with_limits(LimitsConfig {
            max_local_traces_per_user: 4,
            ..Default::default()
        })
        .await;
        let i = &env.instance;

        for _ in 0..4 {
            let (_, request) = make_request(&[]);
            i.push_bytes_request(&cancel(), request).await.unwrap();
        }

        let (_, request) = make_request(&[]);
        let err = i.push_bytes_request(&cancel(), request).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::LiveTracesExceeded { limit: 4, .. }
        ));
        assert_eq!(i.trace_count(), 4);
    }

    #[tokio::test]
    async fn per_trace_byte_limit_enforced_within_request_stream() {
        let env = instance_with_limits(LimitsConfig {
            max_bytes_per_trace: 1000,
            ..Default::default()
        })
        .await;
        let i = &env.instance;

        // Distinct traces each under the limit: all fine.
        for target in [300, 500, 900] {
            let (_, request) = request_with_byte_limit(target, &[]);
            i.push_bytes_request(&cancel(), request).await.unwrap();
        }

        // One oversized trace fails, without poisoning its neighbours.
        let (_, request) = request_with_byte_limit(1500, &[]);
        assert!(i.push_bytes_request(&cancel(), request).await.is_err());
        let (_, request) = request_with_byte_limit(900, &[]);
        i.push_bytes_request(&cancel(), request).await.unwrap();

        // Two pushes to the same trace crossing the limit together.
        let (_, request) = request_with_byte_limit(500, &[0x01]);
        i.push_bytes_request(&cancel(), request).await.unwrap();
        let (_, request) = request_with_byte_limit(700, &[0x01]);
        assert!(matches!(
            i.push_bytes_request(&cancel(), request).await.unwrap_err(),
            IngestError::TraceTooLarge { .. }
        ));
    }

    /// The poisoned-ID contract: an oversized trace keeps rejecting pushes
    /// through cuts of the live table, and only recovers once the head
    /// block itself is cut.
    #[tokio::test]
    async fn too_large_trace_stays_rejected_until_block_cut() {
        let max = 100;
        let env = instance_with_limits(LimitsConfig {
            max_bytes_per_trace: max,
            ..Default::default()
        })
        .await;
        let i = &env.instance;
        let id: Vec<u8> = (1..=16).collect();

        async fn push(i: &TenantInstance, id: &[u8], n: usize) -> Result<(), IngestError> {
            i.push_bytes(&CancellationToken::new(), id, vec![0u8; n], None)
                .await
        }

        // Fill the trace to exactly the limit.
        push(i, &id, max).await.unwrap();

        // One more byte over: rejected, with the offending size reported.
        match push(i, &id, 3).await.unwrap_err() {
            IngestError::TraceTooLarge { max: m, offending, .. } => {
                assert_eq!(m, max);
                assert_eq!(offending, 3);
            }
            other => panic!("expected TraceTooLarge, got {other:?}"),
        }

        // Still rejected after the live trace is cut to the head block.
        i.cut_complete_traces(Duration::ZERO, true).await.unwrap();
        match push(i, &id, 5).await.unwrap_err() {
            IngestError::TraceTooLarge { offending, .. } => assert_eq!(offending, 5),
            other => panic!("expected TraceTooLarge, got {other:?}"),
        }

        // Cutting the head block clears the verdict; the same ID works again.
        i.cut_block_if_ready(Duration::ZERO, 0, true).await.unwrap();
        push(i, &id, max).await.unwrap();
    }

    #[tokio::test]
    async fn request_too_large_rejected_before_any_push() {
        let env = instance_with_limits(LimitsConfig {
            max_bytes_per_request: 50,
            ..Default::default()
        })
        .await;
        let i = &env.instance;

        let request = PushRequest::new(
            vec![random_trace_id(), random_trace_id()],
            vec![vec![0u8; 30], vec![0u8; 30]],
        );
        let err = i.push_bytes_request(&cancel(), request).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::RequestTooLarge { size: 60, limit: 50 }
        ));
        // Nothing was applied.
        assert_eq!(i.trace_count(), 0);
    }

    #[tokio::test]
    async fn mismatched_request_arrays_rejected() {
        let env = default_instance().await;
        let request = PushRequest::new(vec![random_trace_id()], vec![]);
        assert!(matches!(
            env.instance
                .push_bytes_request(&cancel(), request)
                .await
                .unwrap_err(),
            IngestError::MalformedRequest(_)
        ));
    }

    #[rstest]
    #[case::immediate(Duration::ZERO, true, true, true)]
    #[case::recent_only(Duration::ZERO, false, true, false)]
    #[case::wide_window(Duration::from_secs(2 * 3600), false, true, true)]
    #[tokio::test]
    async fn cut_complete_traces_timing(
        #[case] cutoff: Duration,
        #[case] immediate: bool,
        #[case] cuts_past: bool,
        #[case] cuts_future: bool,
    ) {
        use crate::live_traces::LiveTrace;

        let env = default_instance().await;
        let i = &env.instance;

        let past_id = random_trace_id();
        let future_id = random_trace_id();
        let mut past = LiveTrace::new(past_id.clone());
        past.last_append = Instant::now() - Duration::from_secs(3600);
        let mut future = LiveTrace::new(future_id.clone());
        future.last_append = Instant::now() + Duration::from_secs(3600);

        i.live_traces()
            .insert_at(token_for_trace_id(&past_id), past);
        i.live_traces()
            .insert_at(token_for_trace_id(&future_id), future);

        i.cut_complete_traces(cutoff, immediate).await.unwrap();

        let mut expected = 2;
        if cuts_past {
            expected -= 1;
        }
        if cuts_future {
            expected -= 1;
        }
        assert_eq!(i.trace_count(), expected);
        assert_eq!(i.live_traces().find(&past_id).is_some(), !cuts_past);
        assert_eq!(i.live_traces().find(&future_id).is_some(), !cuts_future);
    }

    #[rstest]
    #[case::no_data(0, Duration::from_secs(3600), 1000, false, false)]
    #[case::not_ready(1, Duration::from_secs(3600), 1000, false, false)]
    #[case::immediate(1, Duration::from_secs(3600), 1000, true, true)]
    #[case::lifetime(1, Duration::from_micros(1), 1000, false, true)]
    #[case::size(10, Duration::from_secs(3600), 10, false, true)]
    #[tokio::test]
    async fn cut_block_triggers(
        #[case] push_count: usize,
        #[case] max_lifetime: Duration,
        #[case] max_bytes: u64,
        #[case] immediate: bool,
        #[case] expect_cut: bool,
    ) {
        let env = default_instance().await;
        let i = &env.instance;

        for _ in 0..push_count {
            let (_, request) = make_request(&[]);
            i.push_bytes_request(&cancel(), request).await.unwrap();
        }
        let last_cut = i.last_block_cut().await;

        i.cut_complete_traces(Duration::ZERO, true).await.unwrap();

        let block_id = i
            .cut_block_if_ready(max_lifetime, max_bytes, immediate)
            .await
            .unwrap();

        assert_eq!(block_id.is_some(), expect_cut);
        assert_eq!(i.last_block_cut().await > last_cut, expect_cut);
        if let Some(block_id) = block_id {
            i.complete_block(block_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn complete_block_is_idempotent_and_strict() {
        let env = default_instance().await;
        let i = &env.instance;

        let (_, request) = make_request(&[]);
        i.push_bytes_request(&cancel(), request).await.unwrap();
        i.cut_complete_traces(Duration::ZERO, true).await.unwrap();
        let block_id = i
            .cut_block_if_ready(Duration::ZERO, 0, true)
            .await
            .unwrap()
            .unwrap();

        i.complete_block(block_id).await.unwrap();
        // Completing again is a no-op.
        i.complete_block(block_id).await.unwrap();
        assert_eq!(i.complete_block_count().await, 1);

        // Unknown IDs are an error.
        assert!(matches!(
            i.complete_block(Uuid::new_v4()).await.unwrap_err(),
            IngestError::BlockNotFound { .. }
        ));

        // Clearing twice is an error.
        i.clear_completing_block(block_id).await.unwrap();
        assert!(matches!(
            i.clear_completing_block(block_id).await.unwrap_err(),
            IngestError::BlockNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn find_honours_cancellation() {
        let env = default_instance().await;
        let i = &env.instance;

        let token = CancellationToken::new();
        token.cancel();
        let err = i
            .find_trace_by_id(&token, &random_trace_id())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));
    }

    #[tokio::test]
    async fn missing_trace_finds_nothing() {
        let env = default_instance().await;
        let found = env
            .instance
            .find_trace_by_id(&cancel(), &random_trace_id())
            .await
            .unwrap();
        assert!(found.is_none());
    }

    /// Run the whole surface concurrently for a bounded period and verify
    /// the engine settles with its invariants intact.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_surface_does_not_race() {
        let env = Arc::new(default_instance().await);
        let stop = CancellationToken::new();
        let mut handles = Vec::new();

        for _ in 0..2 {
            let env = env.clone();
            let stop = stop.clone();
            handles.push(tokio::spawn(async move {
                while !stop.is_cancelled() {
                    let (_, request) = make_request(&[]);
                    env.instance
                        .push_bytes_request(&CancellationToken::new(), request)
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }

        {
            let env = env.clone();
            let stop = stop.clone();
            handles.push(tokio::spawn(async move {
                while !stop.is_cancelled() {
                    env.instance
                        .cut_complete_traces(Duration::ZERO, true)
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }

        {
            let env = env.clone();
            let stop = stop.clone();
            handles.push(tokio::spawn(async move {
                while !stop.is_cancelled() {
                    if let Some(block_id) = env
                        .instance
                        .cut_block_if_ready(Duration::ZERO, 0, false)
                        .await
                        .unwrap()
                    {
                        env.instance.complete_block(block_id).await.unwrap();
                        env.instance.clear_completing_block(block_id).await.unwrap();
                        if let Some(block) =
                            env.instance.get_block_to_be_flushed(block_id).await
                        {
                            block.mark_flushed();
                        }
                    }
                    env.instance
                        .clear_flushed_blocks(Duration::ZERO)
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }

        {
            let env = env.clone();
            let stop = stop.clone();
            handles.push(tokio::spawn(async move {
                while !stop.is_cancelled() {
                    env.instance
                        .find_trace_by_id(&CancellationToken::new(), &[0x01])
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        stop.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        // Count coherence survives the churn.
        let i = &env.instance;
        assert_eq!(i.trace_count(), i.live_traces().len());
    }
}

//! The live-trace table: in-memory accumulation of spans before they are
//! cut to the head block.
//!
//! The table is keyed by a fingerprint of the trace ID and sharded via
//! `DashMap`, so pushes for different traces rarely contend. Fingerprints
//! can collide; the full trace ID is stored on every entry and verified on
//! lookup, with colliding traces sharing a bucket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use xxhash_rust::xxh3::xxh3_64;

/// Fingerprint of a trace ID: a uniform hash over the full byte string.
pub fn token_for_trace_id(trace_id: &[u8]) -> u64 {
    xxh3_64(trace_id)
}

/// One trace accumulating span batches in memory.
#[derive(Debug)]
pub(crate) struct LiveTrace {
    /// The full trace ID, kept for fingerprint-collision disambiguation.
    pub trace_id: Vec<u8>,
    /// Pushed segment payloads, in arrival order.
    pub batches: Vec<Vec<u8>>,
    /// Sum of appended payload sizes.
    pub byte_size: usize,
    /// When the last batch arrived.
    pub last_append: Instant,
}

impl LiveTrace {
    pub(crate) fn new(trace_id: Vec<u8>) -> Self {
        Self {
            trace_id,
            batches: Vec::new(),
            byte_size: 0,
            last_append: Instant::now(),
        }
    }
}

/// Outcome of a push against the table.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// The batch was appended (to an existing or freshly created trace).
    Appended,
    /// Appending would take the trace past its byte limit; nothing changed.
    WouldExceedSize {
        /// The size the trace would have grown to.
        new_size: usize,
    },
    /// The tenant is at its live-trace capacity; no trace was created.
    AtCapacity {
        /// Live traces at the time of the check.
        live: usize,
    },
}

/// Sharded map of `fingerprint → live traces`.
#[derive(Debug, Default)]
pub(crate) struct LiveTraceTable {
    buckets: DashMap<u64, Vec<LiveTrace>>,
    count: AtomicUsize,
}

impl LiveTraceTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of live traces across all buckets.
    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Append a batch to the trace with this ID, creating it if absent.
    ///
    /// `max_bytes` bounds the accumulated size per trace and `capacity`
    /// bounds the number of live traces; zero disables either check. The
    /// whole operation happens under the bucket's shard lock, so the size
    /// accounting and the capacity check cannot race a concurrent push for
    /// the same fingerprint.
    pub(crate) fn push(
        &self,
        trace_id: &[u8],
        batch: Vec<u8>,
        max_bytes: usize,
        capacity: usize,
    ) -> PushOutcome {
        self.push_at(token_for_trace_id(trace_id), trace_id, batch, max_bytes, capacity)
    }

    pub(crate) fn push_at(
        &self,
        token: u64,
        trace_id: &[u8],
        batch: Vec<u8>,
        max_bytes: usize,
        capacity: usize,
    ) -> PushOutcome {
        let mut bucket = self.buckets.entry(token).or_default();

        if let Some(trace) = bucket.iter_mut().find(|t| t.trace_id == trace_id) {
            let new_size = trace.byte_size + batch.len();
            if max_bytes > 0 && new_size > max_bytes {
                return PushOutcome::WouldExceedSize { new_size };
            }
            trace.byte_size = new_size;
            trace.batches.push(batch);
            trace.last_append = Instant::now();
            return PushOutcome::Appended;
        }

        let live = self.count.load(Ordering::Acquire);
        if capacity > 0 && live >= capacity {
            return PushOutcome::AtCapacity { live };
        }
        if max_bytes > 0 && batch.len() > max_bytes {
            return PushOutcome::WouldExceedSize { new_size: batch.len() };
        }

        let mut trace = LiveTrace::new(trace_id.to_vec());
        trace.byte_size = batch.len();
        trace.batches.push(batch);
        bucket.push(trace);
        self.count.fetch_add(1, Ordering::AcqRel);
        PushOutcome::Appended
    }

    /// Clone the pushed batches for this trace ID, if it is live.
    pub(crate) fn find(&self, trace_id: &[u8]) -> Option<Vec<Vec<u8>>> {
        let bucket = self.buckets.get(&token_for_trace_id(trace_id))?;
        bucket
            .iter()
            .find(|t| t.trace_id == trace_id)
            .map(|t| t.batches.clone())
    }

    /// Remove and return every trace eligible for cutting.
    ///
    /// A trace is eligible when `immediate` is set or its last append is
    /// older than `now + cutoff`; a cutoff larger than zero therefore also
    /// sweeps up traces stamped slightly in the future.
    pub(crate) fn cut(&self, cutoff: std::time::Duration, immediate: bool) -> Vec<LiveTrace> {
        let now = Instant::now();
        let cutoff_time = now.checked_add(cutoff);

        let mut out = Vec::new();
        self.buckets.retain(|_, bucket| {
            let drained = std::mem::take(bucket);
            for trace in drained {
                let expired = match cutoff_time {
                    Some(t) => trace.last_append < t,
                    None => true,
                };
                if immediate || expired {
                    out.push(trace);
                } else {
                    bucket.push(trace);
                }
            }
            !bucket.is_empty()
        });

        self.count.fetch_sub(out.len(), Ordering::AcqRel);
        out
    }

    /// Insert a prebuilt trace under an explicit token. Test seam for
    /// collision injection and cut-timing scenarios.
    #[cfg(test)]
    pub(crate) fn insert_at(&self, token: u64, trace: LiveTrace) {
        self.buckets.entry(token).or_default().push(trace);
        self.count.fetch_add(1, Ordering::AcqRel);
    }
}

//! Merging traces that share an ID.
//!
//! A trace ID legitimately shows up in several places at once: the live
//! table, the head block, and any number of older blocks. Every read path
//! therefore funnels through [`combine`], and block compaction relies on it
//! to collapse duplicate records. The merge is associative, commutative, and
//! idempotent: `combine(a, a)` normalises back to `a`.

use std::collections::HashSet;

use crate::Trace;

/// Merge two traces sharing an ID into one canonical trace.
///
/// Spans are deduplicated by span ID across all batches (first occurrence
/// wins), empty scopes and batches are dropped, and the result is
/// normalised.
pub fn combine(a: Trace, b: Trace) -> Trace {
    let mut merged = a;
    merged.batches.extend(b.batches);

    let mut seen: HashSet<Vec<u8>> = HashSet::new();
    for batch in &mut merged.batches {
        for scope in &mut batch.scope_spans {
            // Spans without an ID cannot be identified as duplicates; keep them.
            scope
                .spans
                .retain(|s| s.span_id.is_empty() || seen.insert(s.span_id.clone()));
        }
        batch.scope_spans.retain(|s| !s.spans.is_empty());
    }
    merged.batches.retain(|b| !b.scope_spans.is_empty());

    merged.normalise();
    merged
}

/// Fold an arbitrary number of traces into one, or `None` if the iterator is
/// empty.
pub fn combine_all(traces: impl IntoIterator<Item = Trace>) -> Option<Trace> {
    let mut iter = traces.into_iter();
    let first = iter.next()?;
    let mut acc = first;
    let mut merged_any = false;
    for next in iter {
        acc = combine(acc, next);
        merged_any = true;
    }
    if !merged_any {
        acc.normalise();
    }
    Some(acc)
}

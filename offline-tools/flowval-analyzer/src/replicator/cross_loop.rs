//! Merging replicated flows across loop boundaries.
//!
//! A probe's flow cache sees consecutive loops of the same flow as one flow
//! unless the gap between them reaches its inactive timeout.

use crate::merge::{CounterOverflowError, FlowAggregate};
use flowval_schema::{FlowKey, FlowRecord};
use std::collections::BTreeMap;

/// Merge records sharing a flow key, ignoring loop boundaries.
///
/// Each group is sorted by start time and cut after a record whenever the
/// gap to the next record's start is at least `inactive_timeout_ms`. Without
/// a timeout every group becomes a single record. Output is ordered by flow
/// key, then by start time. Fails when merged counters exceed 64 bits.
pub fn merge_across_loops(
    records: Vec<FlowRecord>,
    inactive_timeout_ms: Option<u64>,
) -> Result<Vec<FlowRecord>, CounterOverflowError> {
    let mut groups: BTreeMap<FlowKey, Vec<FlowRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.key()).or_default().push(record);
    }

    let mut merged = Vec::with_capacity(groups.len());
    for (_, mut group) in groups {
        group.sort_by_key(|r| r.start_time);

        let mut iter = group.iter();
        let Some(first) = iter.next() else {
            continue;
        };
        let mut current = FlowAggregate::new(first);
        let mut prev_end = first.end_time;

        for record in iter {
            let gap = i128::from(record.start_time) - i128::from(prev_end);
            let split = inactive_timeout_ms.is_some_and(|timeout| gap >= i128::from(timeout));
            if split {
                let finished = std::mem::replace(&mut current, FlowAggregate::new(record));
                merged.push(finished.into_record());
            } else {
                current.add(record)?;
            }
            prev_end = record.end_time;
        }
        merged.push(current.into_record());
    }
    Ok(merged)
}

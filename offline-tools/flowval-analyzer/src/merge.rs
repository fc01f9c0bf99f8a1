//! Flow merging by flow key.

use crate::dataset::FlowDataset;
use crate::logger::Logger;
use flowval_schema::{DirectionInvariantKey, FlowKey, FlowRecord};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

/// Combined counters of one flow no longer fit a 64-bit column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("packet or byte counter of flow {key} exceeds 64 bits")]
pub struct CounterOverflowError {
    pub key: FlowKey,
}

/// Errors from merging flows.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("cannot merge flows, reference contains flow key {key} {count} times")]
    DuplicateReferenceKey { key: FlowKey, count: usize },

    #[error(transparent)]
    CounterOverflow(#[from] CounterOverflowError),
}

/// Running aggregate of a group of records with the same flow key.
#[derive(Debug, Clone)]
pub(crate) struct FlowAggregate {
    record: FlowRecord,
    count: u64,
}

impl FlowAggregate {
    pub(crate) fn new(record: &FlowRecord) -> Self {
        Self {
            record: record.clone(),
            count: 1,
        }
    }

    /// Fold another record in: min start, max end, summed counters.
    ///
    /// The aggregate is left unchanged when a counter would overflow.
    pub(crate) fn add(&mut self, other: &FlowRecord) -> Result<(), CounterOverflowError> {
        let overflow = || CounterOverflowError { key: self.record.key() };
        let packets = self.record.packets.checked_add(other.packets).ok_or_else(overflow)?;
        let bytes = self.record.bytes.checked_add(other.bytes).ok_or_else(overflow)?;

        self.record.start_time = self.record.start_time.min(other.start_time);
        self.record.end_time = self.record.end_time.max(other.end_time);
        self.record.packets = packets;
        self.record.bytes = bytes;
        self.count += 1;
        Ok(())
    }

    /// Finished record with `flow_count` set to the group size.
    pub(crate) fn finish(self) -> FlowRecord {
        FlowRecord {
            flow_count: Some(self.count),
            ..self.record
        }
    }

    /// Finished record without a group size.
    pub(crate) fn into_record(self) -> FlowRecord {
        FlowRecord {
            flow_count: None,
            ..self.record
        }
    }
}

/// Check that every flow key occurs at most once in `reference`.
pub fn check_unique_keys(reference: &FlowDataset) -> Result<(), MergeError> {
    let mut counts: BTreeMap<FlowKey, usize> = BTreeMap::new();
    for record in reference.iter() {
        *counts.entry(record.key()).or_default() += 1;
    }
    match counts.into_iter().find(|(_, count)| *count > 1) {
        Some((key, count)) => Err(MergeError::DuplicateReferenceKey { key, count }),
        None => Ok(()),
    }
}

/// Merge probe records sharing a flow key.
///
/// Allowed only when the flow key is unique in `reference`. Each output
/// record carries the number of merged records in `flow_count`. With
/// `biflow_ts_correction`, both directions of a conversation get the
/// earliest start and latest end seen in either direction.
pub fn merge_flows(
    flows: &FlowDataset,
    reference: &FlowDataset,
    biflow_ts_correction: bool,
    logger: &dyn Logger,
) -> Result<FlowDataset, MergeError> {
    check_unique_keys(reference)?;

    let mut groups: BTreeMap<FlowKey, FlowAggregate> = BTreeMap::new();
    for record in flows.iter() {
        match groups.entry(record.key()) {
            Entry::Occupied(mut entry) => entry.get_mut().add(record)?,
            Entry::Vacant(entry) => {
                entry.insert(FlowAggregate::new(record));
            }
        }
    }
    logger.debug(&format!(
        "merged {} probe flows into {} flow keys",
        flows.len(),
        groups.len()
    ));

    let mut merged: Vec<FlowRecord> = groups.into_values().map(FlowAggregate::finish).collect();

    if biflow_ts_correction {
        correct_biflow_timestamps(&mut merged);
    }

    Ok(FlowDataset::from_derived(merged))
}

/// Align timestamps of both directions of each conversation.
fn correct_biflow_timestamps(records: &mut [FlowRecord]) {
    let mut bounds: HashMap<DirectionInvariantKey, (u64, u64)> = HashMap::new();
    for record in records.iter() {
        bounds
            .entry(record.invariant_key())
            .and_modify(|(start, end)| {
                *start = (*start).min(record.start_time);
                *end = (*end).max(record.end_time);
            })
            .or_insert((record.start_time, record.end_time));
    }

    for record in records.iter_mut() {
        if let Some((start, end)) = bounds.get(&record.invariant_key()) {
            record.start_time = *start;
            record.end_time = *end;
        }
    }
}

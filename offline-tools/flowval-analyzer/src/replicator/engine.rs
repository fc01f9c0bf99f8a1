//! Per-loop replication.

use super::config::ReplicatorConfig;
use super::cross_loop::merge_across_loops;
use super::ReplicatorError;
use crate::config::ReplicateOptions;
use crate::dataset::FlowDataset;
use crate::logger::SharedLogger;
use crate::merge::CounterOverflowError;
use flowval_schema::{add_offset, FlowRecord};
use rayon::prelude::*;
use serde_json::Value;
use std::collections::BTreeSet;

/// Minimum number of replicas a rayon task rewrites at once.
const ADDRESS_CHUNK_ROWS: usize = 4096;

/// Source record with its loop-relative timing precomputed.
#[derive(Debug)]
struct Template<'a> {
    record: &'a FlowRecord,
    start_offset: u64,
    flow_len: u64,
}

/// One output record before addresses are rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Replica {
    index: usize,
    loop_n: u32,
    src_offset: u32,
    dst_offset: u32,
    /// Units that produced this exact record within the loop.
    copies: u64,
}

/// Expands a single-loop reference into the multi-loop reference.
pub struct ReplicationEngine {
    config: ReplicatorConfig,
    ignore_loops: BTreeSet<u32>,
    logger: SharedLogger,
}

impl ReplicationEngine {
    /// Parse an ft-replay style configuration.
    ///
    /// Loops in `ignore_loops` are skipped during replication.
    pub fn new(config: &Value, ignore_loops: &[u32], logger: SharedLogger) -> Result<Self, ReplicatorError> {
        let ignore_loops: BTreeSet<u32> = ignore_loops.iter().copied().collect();
        let config = ReplicatorConfig::parse(config, &ignore_loops)?;
        logger.debug(&format!(
            "replicator configured with {} units, ignoring loops {:?}",
            config.units.len(),
            ignore_loops
        ));
        Ok(Self::with_config(config, ignore_loops, logger))
    }

    /// Create an engine from an already parsed configuration.
    pub fn with_config(config: ReplicatorConfig, ignore_loops: BTreeSet<u32>, logger: SharedLogger) -> Self {
        Self {
            config,
            ignore_loops,
            logger,
        }
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Replicate `dataset` over `options.loops` replay loops.
    pub fn replicate(&self, dataset: &FlowDataset, options: &ReplicateOptions) -> Result<FlowDataset, ReplicatorError> {
        let speed = options.speed_multiplier;
        if !speed.is_finite() || speed <= 0.0 {
            return Err(ReplicatorError::InvalidSpeed(speed));
        }

        let (loop_start, loop_end) = match dataset.time_bounds() {
            Some(bounds) => bounds,
            None => return Ok(FlowDataset::default()),
        };

        let time_multiplier = 1.0 / speed;
        let loop_length = scale(loop_end - loop_start, time_multiplier);
        let templates: Vec<Template<'_>> = dataset
            .iter()
            .map(|record| Template {
                record,
                start_offset: scale(record.start_time - loop_start, time_multiplier),
                flow_len: scale(record.duration_ms(), time_multiplier),
            })
            .collect();

        let mut replicas = Vec::new();
        for loop_n in 0..options.loops {
            if self.ignore_loops.contains(&loop_n) {
                self.logger.debug(&format!("skipping ignored loop {}", loop_n));
                continue;
            }
            self.logger.debug(&format!("processing loop {}", loop_n));
            replicas.extend(self.replicate_loop(loop_n, templates.len()));
        }

        let records: Vec<FlowRecord> = replicas
            .par_iter()
            .with_min_len(ADDRESS_CHUNK_ROWS)
            .map(|replica| {
                let template = &templates[replica.index];
                let time_offset = loop_start.saturating_add(u64::from(replica.loop_n).saturating_mul(loop_length));
                let start_time = time_offset.saturating_add(template.start_offset);
                let mut record = FlowRecord {
                    start_time,
                    end_time: start_time.saturating_add(template.flow_len),
                    src_ip: add_offset(template.record.src_ip, replica.src_offset),
                    dst_ip: add_offset(template.record.dst_ip, replica.dst_offset),
                    flow_count: None,
                    ..template.record.clone()
                };
                // units landing on the same addresses add up their counters
                match (
                    record.packets.checked_mul(replica.copies),
                    record.bytes.checked_mul(replica.copies),
                ) {
                    (Some(packets), Some(bytes)) => {
                        record.packets = packets;
                        record.bytes = bytes;
                        Ok(record)
                    }
                    _ => Err(CounterOverflowError { key: record.key() }),
                }
            })
            .collect::<Result<_, _>>()?;

        self.logger.verbose(&format!(
            "replicated {} flows into {} flows over {} loops",
            dataset.len(),
            records.len(),
            options.loops
        ));

        if options.merge_across_loops {
            let merged = merge_across_loops(records, options.inactive_timeout_ms)?;
            self.logger.verbose(&format!("{} flows after merging across loops", merged.len()));
            return Ok(FlowDataset::from_derived(merged));
        }
        Ok(FlowDataset::from_derived(records))
    }

    /// Replicas of every source record for one loop.
    ///
    /// Records a unit leaves at the same addresses as another unit collapse
    /// into one replica. Output is ordered by source record, then by first
    /// producing unit.
    fn replicate_loop(&self, loop_n: u32, source_len: usize) -> Vec<Replica> {
        let loop_src = self.config.loop_unit.src_offset().wrapping_mul(loop_n);
        let loop_dst = self.config.loop_unit.dst_offset().wrapping_mul(loop_n);

        let mut offsets: Vec<(u32, u32, u64)> = Vec::new();
        for unit in self.config.units_in_loop(loop_n) {
            let src = loop_src.wrapping_add(unit.src_offset());
            let dst = loop_dst.wrapping_add(unit.dst_offset());
            match offsets.iter_mut().find(|(s, d, _)| *s == src && *d == dst) {
                Some((_, _, copies)) => *copies += 1,
                None => offsets.push((src, dst, 1)),
            }
        }

        (0..source_len)
            .flat_map(|index| {
                offsets.iter().map(move |&(src_offset, dst_offset, copies)| Replica {
                    index,
                    loop_n,
                    src_offset,
                    dst_offset,
                    copies,
                })
            })
            .collect()
    }
}

/// Scale a millisecond span by the time multiplier, flooring the result.
fn scale(ms: u64, time_multiplier: f64) -> u64 {
    if time_multiplier == 1.0 {
        return ms;
    }
    // float to int casts saturate
    (ms as f64 * time_multiplier).floor() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{null_logger, MockLogger};
    use proptest::prelude::*;
    use serde_json::json;
    use std::net::IpAddr;
    use std::sync::Arc;

    fn make_record(src: &str, dst: &str, start: u64, end: u64) -> FlowRecord {
        FlowRecord {
            start_time: start,
            end_time: end,
            protocol: 6,
            src_ip: src.parse().unwrap(),
            dst_ip: dst.parse().unwrap(),
            src_port: 1,
            dst_port: 80,
            packets: 5,
            bytes: 500,
            flow_count: None,
        }
    }

    fn engine(config: Value) -> ReplicationEngine {
        ReplicationEngine::new(&config, &[], null_logger()).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    // ===========================================
    // Loop Expansion
    // ===========================================

    #[test]
    fn test_unit_and_loop_offsets_accumulate() {
        let engine = engine(json!({
            "units": [{ "srcip": "addConstant(16777216)" }],
            "loop": { "srcip": "addConstant(16777216)" },
        }));
        let dataset = FlowDataset::new(vec![make_record("10.0.0.1", "10.0.0.2", 1000, 2000)]);

        let out = engine.replicate(&dataset, &ReplicateOptions::new(2)).unwrap();

        assert_eq!(out.len(), 2);
        let first = &out.records()[0];
        assert_eq!(first.src_ip, ip("11.0.0.1"));
        assert_eq!(first.dst_ip, ip("10.0.0.2"));
        assert_eq!((first.start_time, first.end_time), (1000, 2000));

        let second = &out.records()[1];
        assert_eq!(second.src_ip, ip("12.0.0.1"));
        assert_eq!((second.start_time, second.end_time), (2000, 3000));
        assert_eq!(second.packets, 5);
    }

    #[test]
    fn test_loop_length_spans_whole_input() {
        let engine = engine(json!({}));
        let dataset = FlowDataset::new(vec![
            make_record("10.0.0.1", "10.0.0.2", 1000, 1500),
            make_record("10.0.0.3", "10.0.0.2", 1200, 3000),
        ]);

        let out = engine.replicate(&dataset, &ReplicateOptions::new(3)).unwrap();

        let starts: Vec<u64> = out.iter().map(|r| r.start_time).collect();
        assert_eq!(starts, vec![1000, 1200, 3000, 3200, 5000, 5200]);
    }

    #[test]
    fn test_units_producing_same_addresses_merge() {
        let engine = engine(json!({
            "units": [{}, { "dstip": "None" }, { "srcip": "addConstant(1)" }],
        }));
        let dataset = FlowDataset::new(vec![make_record("10.0.0.1", "10.0.0.2", 0, 100)]);

        let out = engine.replicate(&dataset, &ReplicateOptions::new(1)).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out.records()[0].src_ip, ip("10.0.0.1"));
        assert_eq!(out.records()[0].packets, 10);
        assert_eq!(out.records()[0].bytes, 1000);
        assert_eq!(out.records()[1].src_ip, ip("10.0.0.2"));
        assert_eq!(out.records()[1].packets, 5);
    }

    #[test]
    fn test_collapsed_units_counter_overflow_is_error() {
        let engine = engine(json!({ "units": [{}, {}] }));
        let mut record = make_record("10.0.0.1", "10.0.0.2", 0, 100);
        record.bytes = u64::MAX / 2 + 1;
        let dataset = FlowDataset::new(vec![record.clone()]);

        let err = engine.replicate(&dataset, &ReplicateOptions::new(1)).unwrap_err();
        assert_eq!(
            err,
            ReplicatorError::CounterOverflow(CounterOverflowError { key: record.key() })
        );
    }

    #[test]
    fn test_merge_across_loops_counter_overflow_is_error() {
        let engine = engine(json!({}));
        let mut record = make_record("10.0.0.1", "10.0.0.2", 0, 100);
        record.packets = u64::MAX / 2 + 1;
        let dataset = FlowDataset::new(vec![record]);

        let options = ReplicateOptions::new(2).with_merge_across_loops(true);
        let result = engine.replicate(&dataset, &options);
        assert!(matches!(result, Err(ReplicatorError::CounterOverflow(_))));
    }

    #[test]
    fn test_identical_source_records_stay_separate() {
        let engine = engine(json!({}));
        let record = make_record("10.0.0.1", "10.0.0.2", 0, 100);
        let dataset = FlowDataset::new(vec![record.clone(), record]);

        let out = engine.replicate(&dataset, &ReplicateOptions::new(1)).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.packets == 5));
    }

    #[test]
    fn test_loop_only_units() {
        let engine = engine(json!({
            "units": [
                { "srcip": "addConstant(1)" },
                { "srcip": "addConstant(2)", "loopOnly": 1 },
            ],
        }));
        let dataset = FlowDataset::new(vec![make_record("10.0.0.1", "10.0.0.2", 0, 100)]);

        let out = engine.replicate(&dataset, &ReplicateOptions::new(2)).unwrap();

        let sources: Vec<IpAddr> = out.iter().map(|r| r.src_ip).collect();
        assert_eq!(sources, vec![ip("10.0.0.2"), ip("10.0.0.2"), ip("10.0.0.3")]);
    }

    #[test]
    fn test_ignored_loops_skipped() {
        let logger = MockLogger::new();
        let engine = ReplicationEngine::new(
            &json!({ "units": [{ "srcip": "addCounter(1, 1)", "loopOnly": [0] }, {}] }),
            &[0],
            Arc::new(logger.clone()),
        )
        .unwrap();
        let dataset = FlowDataset::new(vec![make_record("10.0.0.1", "10.0.0.2", 0, 100)]);

        let out = engine.replicate(&dataset, &ReplicateOptions::new(2)).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out.records()[0].start_time, 100);
        assert!(logger.contains("skipping ignored loop 0"));
    }

    #[test]
    fn test_ipv6_offset_shifts_top_bits() {
        let engine = engine(json!({ "units": [{ "dstip": "addConstant(1)" }] }));
        let dataset = FlowDataset::new(vec![make_record("2001:db8::1", "ffff:ffff:ffff:ffff::", 0, 10)]);

        let out = engine.replicate(&dataset, &ReplicateOptions::new(1)).unwrap();
        assert_eq!(out.records()[0].dst_ip, ip("0:0:ffff:ffff::"));
        assert_eq!(out.records()[0].src_ip, ip("2001:db8::1"));
    }

    #[test]
    fn test_ipv4_offset_wraps() {
        let engine = engine(json!({ "units": [{ "srcip": "addConstant(2)" }] }));
        let dataset = FlowDataset::new(vec![make_record("255.255.255.255", "10.0.0.2", 0, 10)]);

        let out = engine.replicate(&dataset, &ReplicateOptions::new(1)).unwrap();
        assert_eq!(out.records()[0].src_ip, ip("0.0.0.1"));
    }

    // ===========================================
    // Speed
    // ===========================================

    #[test]
    fn test_speed_multiplier_scales_time() {
        let engine = engine(json!({}));
        let dataset = FlowDataset::new(vec![
            make_record("10.0.0.1", "10.0.0.2", 1000, 1001),
            make_record("10.0.0.3", "10.0.0.2", 1003, 2000),
        ]);

        let fast = engine
            .replicate(&dataset, &ReplicateOptions::new(2).with_speed_multiplier(2.0))
            .unwrap();
        let spans: Vec<(u64, u64)> = fast.iter().map(|r| (r.start_time, r.end_time)).collect();
        // loop length floor(1000 / 2) = 500, flow lengths floor(1 / 2) = 0 and floor(997 / 2) = 498
        assert_eq!(spans, vec![(1000, 1000), (1001, 1499), (1500, 1500), (1501, 1999)]);

        let slow = engine
            .replicate(&dataset, &ReplicateOptions::new(1).with_speed_multiplier(0.5))
            .unwrap();
        assert_eq!(slow.records()[1].start_time, 1006);
        assert_eq!(slow.records()[1].end_time, 3000);
    }

    #[test]
    fn test_invalid_speed_rejected() {
        let engine = engine(json!({}));
        let dataset = FlowDataset::new(vec![make_record("10.0.0.1", "10.0.0.2", 0, 10)]);
        for speed in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let result = engine.replicate(&dataset, &ReplicateOptions::new(1).with_speed_multiplier(speed));
            assert!(matches!(result, Err(ReplicatorError::InvalidSpeed(_))));
        }
    }

    // ===========================================
    // Edge Cases
    // ===========================================

    #[test]
    fn test_empty_input_replicates_to_empty() {
        let out = engine(json!({})).replicate(&FlowDataset::default(), &ReplicateOptions::new(3)).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_zero_loops() {
        let dataset = FlowDataset::new(vec![make_record("10.0.0.1", "10.0.0.2", 0, 10)]);
        let out = engine(json!({})).replicate(&dataset, &ReplicateOptions::new(0)).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_merge_across_loops_option() {
        let engine = engine(json!({}));
        let dataset = FlowDataset::new(vec![make_record("10.0.0.1", "10.0.0.2", 0, 1000)]);

        let options = ReplicateOptions::new(3).with_merge_across_loops(true);
        let merged = engine.replicate(&dataset, &options).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.records()[0].packets, 15);
        assert_eq!((merged.records()[0].start_time, merged.records()[0].end_time), (0, 3000));

        let split = engine
            .replicate(&dataset, &options.with_inactive_timeout_ms(Some(0)))
            .unwrap();
        assert_eq!(split.len(), 3);
    }

    // ===========================================
    // Properties
    // ===========================================

    proptest! {
        #[test]
        fn prop_single_loop_without_offsets_is_identity(
            rows in proptest::collection::vec((any::<u32>(), any::<u32>(), 0u64..1_000_000, 0u64..10_000), 1..30),
        ) {
            let records: Vec<FlowRecord> = rows
                .iter()
                .map(|(src, dst, start, len)| FlowRecord {
                    start_time: *start,
                    end_time: start + len,
                    protocol: 17,
                    src_ip: IpAddr::from(std::net::Ipv4Addr::from(*src)),
                    dst_ip: IpAddr::from(std::net::Ipv4Addr::from(*dst)),
                    src_port: 53,
                    dst_port: 53,
                    packets: 1,
                    bytes: 64,
                    flow_count: None,
                })
                .collect();
            let dataset = FlowDataset::from_derived(records.clone());

            let out = engine(json!({ "units": [{}], "loop": { "srcip": "addConstant(7)" } }))
                .replicate(&dataset, &ReplicateOptions::new(1))
                .unwrap();
            prop_assert_eq!(out.into_records(), records);
        }
    }
}

//! Comparison engine.
//!
//! Compares flows exported by a probe with a reference. Every rule filters
//! both sides by its segment and evaluates its metrics over the subsets. The
//! precise model is the same engine driven by zero-tolerance rules.

use crate::config::ModelOptions;
use crate::dataset::FlowDataset;
use crate::logger::SharedLogger;
use crate::merge::{merge_flows, MergeError};
use crate::metric::{evaluate, GeneratorStats, Metric, MetricError, MetricKind};
use crate::report::{OutcomeScope, Report, TestOutcome};
use crate::segment::{filter, Segment, SubnetSegment};
use flowval_schema::FlowRecord;
use ipnetwork::IpNetwork;
use std::collections::HashSet;

/// A rule lists the same metric kind more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rule contains duplicated metric {kind}")]
pub struct DuplicateMetricError {
    pub kind: MetricKind,
}

/// Errors aborting a validation run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    DuplicateMetric(#[from] DuplicateMetricError),

    #[error("rule {rule}: {source}")]
    Metric {
        rule: usize,
        #[source]
        source: MetricError,
    },
}

/// Metrics to evaluate over an optional segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    metrics: Vec<Metric>,
    segment: Option<Segment>,
}

impl Rule {
    /// Create a rule. Distinct metric kinds are checked at validation time.
    pub fn new(metrics: Vec<Metric>, segment: Option<Segment>) -> Self {
        Self { metrics, segment }
    }

    /// Rule tolerating no difference for any of `kinds`.
    pub fn zero_tolerance(kinds: &[MetricKind], segment: Option<Segment>) -> Self {
        Self::new(kinds.iter().copied().map(Metric::exact).collect(), segment)
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn segment(&self) -> Option<&Segment> {
        self.segment.as_ref()
    }

    /// Fail on the first metric kind that repeats.
    pub fn check_distinct(&self) -> Result<(), DuplicateMetricError> {
        let mut seen = HashSet::new();
        for metric in &self.metrics {
            if !seen.insert(metric.kind()) {
                return Err(DuplicateMetricError { kind: metric.kind() });
            }
        }
        Ok(())
    }
}

/// Zero-tolerance rules of the precise model.
///
/// Without a prefilter a single rule covers all data. With a prefilter there
/// is one bidirectional rule per subnet, and the complement check should be
/// enabled so that traffic outside the prefilter is reported.
pub fn precise_rules(prefilter: &[IpNetwork]) -> Vec<Rule> {
    if prefilter.is_empty() {
        return vec![Rule::zero_tolerance(&MetricKind::ALL, None)];
    }
    prefilter
        .iter()
        .map(|subnet| {
            let segment = SubnetSegment::new(Some(*subnet), None, true);
            Rule::zero_tolerance(&MetricKind::ALL, Some(segment.into()))
        })
        .collect()
}

/// Compares probe flows with reference flows.
pub struct ComparisonEngine {
    flows: FlowDataset,
    reference: FlowDataset,
    stats: GeneratorStats,
    logger: SharedLogger,
}

impl ComparisonEngine {
    /// Prepare both datasets according to `options`.
    ///
    /// With reference alignment and a non-zero generator start, reference
    /// times are offsets from that start and probe flows starting before it
    /// are dropped. Merging fails when the reference has duplicate flow keys.
    pub fn new(
        flows: FlowDataset,
        reference: FlowDataset,
        stats: GeneratorStats,
        options: &ModelOptions,
        logger: SharedLogger,
    ) -> Result<Self, MergeError> {
        let (mut flows, reference) = if options.align_reference && stats.start_time > 0 {
            align_to_generator(flows, reference, stats.start_time)
        } else {
            (flows, reference)
        };

        if options.merge {
            flows = merge_flows(&flows, &reference, options.biflow_ts_correction, logger.as_ref())?;
        }

        logger.verbose(&format!(
            "comparing {} probe flows with {} reference flows",
            flows.len(),
            reference.len()
        ));

        Ok(Self {
            flows,
            reference,
            stats,
            logger,
        })
    }

    /// Probe flows after alignment and merging.
    pub fn flows(&self) -> &FlowDataset {
        &self.flows
    }

    /// Reference flows after alignment.
    pub fn reference(&self) -> &FlowDataset {
        &self.reference
    }

    /// Evaluate `rules` and build a report.
    ///
    /// With `check_complement`, probe rows selected by no rule are checked
    /// to carry zero packets and bytes.
    pub fn validate(&self, rules: &[Rule], check_complement: bool) -> Result<Report, ValidationError> {
        let mut report = Report::new();
        let mut covered = vec![false; self.flows.len()];

        for (index, rule) in rules.iter().enumerate() {
            rule.check_distinct()?;

            let selection = filter(&self.flows, &self.reference, rule.segment());
            self.logger.verbose(&format!(
                "rule {}: {} probe flows, {} reference flows in {}",
                index,
                selection.flows.len(),
                selection.reference.len(),
                OutcomeScope::from(rule.segment()),
            ));

            for metric in rule.metrics() {
                let measurement = evaluate(metric.kind(), &selection.flows, &selection.reference, &self.stats)
                    .map_err(|source| ValidationError::Metric { rule: index, source })?;
                report.add_test(TestOutcome {
                    metric: *metric,
                    scope: OutcomeScope::from(rule.segment()),
                    value: measurement.value,
                    reference: measurement.reference,
                    diff: measurement.diff,
                });
            }

            for (covered, selected) in covered.iter_mut().zip(&selection.mask) {
                *covered |= *selected;
            }
        }

        if check_complement {
            let complement: Vec<bool> = covered.iter().map(|c| !c).collect();
            let leaked = self.flows.select(&complement);
            self.logger.verbose(&format!("{} probe flows outside all segments", leaked.len()));

            for (kind, value) in [
                (MetricKind::Packets, leaked.total_packets()),
                (MetricKind::Bytes, leaked.total_bytes()),
            ] {
                report.add_test(TestOutcome {
                    metric: Metric::exact(kind),
                    scope: OutcomeScope::Complement,
                    value: value as f64,
                    reference: 0.0,
                    diff: if value == 0 { 0.0 } else { 1.0 },
                });
            }
        }

        Ok(report)
    }
}

fn align_to_generator(flows: FlowDataset, reference: FlowDataset, start: u64) -> (FlowDataset, FlowDataset) {
    let shifted = reference
        .into_records()
        .into_iter()
        .map(|r| FlowRecord {
            start_time: r.start_time.saturating_add(start),
            end_time: r.end_time.saturating_add(start),
            ..r
        })
        .collect();
    let flows = flows.filter(|r| r.start_time >= start);
    (flows, FlowDataset::from_derived(shifted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{null_logger, MockLogger};
    use crate::segment::TimeSegment;
    use std::sync::Arc;

    fn make_record(src: &str, dst: &str, start: u64, end: u64, packets: u64) -> FlowRecord {
        FlowRecord {
            start_time: start,
            end_time: end,
            protocol: 6,
            src_ip: src.parse().unwrap(),
            dst_ip: dst.parse().unwrap(),
            src_port: 40000,
            dst_port: 443,
            packets,
            bytes: packets * 100,
            flow_count: None,
        }
    }

    fn make_engine(flows: Vec<FlowRecord>, reference: Vec<FlowRecord>) -> ComparisonEngine {
        ComparisonEngine::new(
            FlowDataset::new(flows),
            FlowDataset::new(reference),
            GeneratorStats::new(0, 999, 30, 3000),
            &ModelOptions::default(),
            null_logger(),
        )
        .unwrap()
    }

    fn subnet(source: &str) -> Segment {
        SubnetSegment::parse(Some(source), None, true).unwrap().into()
    }

    fn metric(kind: MetricKind, tolerance: f64) -> Metric {
        Metric::new(kind, tolerance).unwrap()
    }

    // ===========================================
    // Rules
    // ===========================================

    #[test]
    fn test_duplicate_metrics_rejected() {
        let engine = make_engine(vec![], vec![]);
        let rule = Rule::new(vec![metric(MetricKind::Packets, 0.1), metric(MetricKind::Packets, 0.2)], None);

        let err = engine.validate(&[rule], false).unwrap_err();
        assert_eq!(
            err,
            ValidationError::DuplicateMetric(DuplicateMetricError { kind: MetricKind::Packets })
        );
    }

    #[test]
    fn test_precise_rules_without_prefilter() {
        let rules = precise_rules(&[]);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].metrics().len(), 6);
        assert!(rules[0].metrics().iter().all(|m| m.tolerance() == 0.0));
        assert!(rules[0].segment().is_none());
    }

    #[test]
    fn test_precise_rules_with_prefilter() {
        let prefilter: Vec<IpNetwork> = vec!["10.0.0.0/8".parse().unwrap(), "2001:db8::/32".parse().unwrap()];
        let rules = precise_rules(&prefilter);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].segment().unwrap().to_string(), "2001:db8::/32 <-> ANY");
    }

    // ===========================================
    // Validation
    // ===========================================

    #[test]
    fn test_validate_whole_dataset() {
        let engine = make_engine(
            vec![make_record("10.0.0.1", "10.0.0.2", 0, 999, 10)],
            vec![make_record("10.0.0.1", "10.0.0.2", 0, 999, 10)],
        );
        let rule = Rule::new(vec![metric(MetricKind::Packets, 0.0), metric(MetricKind::Flows, 0.0)], None);

        let report = engine.validate(&[rule], false).unwrap();
        assert_eq!(report.len(), 2);
        assert!(report.is_passing());
        assert_eq!(report.outcomes()[0].scope, OutcomeScope::Whole);
    }

    #[test]
    fn test_validate_segment_outcome() {
        let engine = make_engine(
            vec![
                make_record("10.0.0.1", "8.8.8.8", 0, 500, 10),
                make_record("192.168.0.1", "8.8.8.8", 0, 500, 99),
            ],
            vec![
                make_record("10.0.0.1", "8.8.8.8", 0, 500, 8),
                make_record("192.168.0.1", "8.8.8.8", 0, 500, 99),
            ],
        );
        let rule = Rule::new(vec![metric(MetricKind::Packets, 0.2)], Some(subnet("10.0.0.0/8")));

        let report = engine.validate(&[rule], false).unwrap();
        let outcome = &report.outcomes()[0];
        assert_eq!(outcome.value, 10.0);
        assert_eq!(outcome.reference, 8.0);
        assert_eq!(outcome.diff, 0.25);
        assert!(!report.is_passing());
    }

    #[test]
    fn test_validate_zero_reference_aborts() {
        let engine = make_engine(vec![make_record("10.0.0.1", "10.0.0.2", 0, 10, 1)], vec![]);
        let rule = Rule::new(vec![metric(MetricKind::Flows, 1.0)], None);

        let err = engine.validate(&[rule], false).unwrap_err();
        assert!(matches!(err, ValidationError::Metric { rule: 0, .. }));
    }

    #[test]
    fn test_validate_overlapping_rules_independent() {
        let records = vec![make_record("10.0.0.1", "10.0.0.2", 0, 10, 5)];
        let engine = make_engine(records.clone(), records);
        let rules = vec![
            Rule::new(vec![metric(MetricKind::Packets, 0.0)], Some(subnet("10.0.0.0/8"))),
            Rule::new(vec![metric(MetricKind::Packets, 0.0)], Some(subnet("10.0.0.0/16"))),
        ];

        let report = engine.validate(&rules, false).unwrap();
        assert_eq!(report.len(), 2);
        assert!(report.outcomes().iter().all(|o| o.value == 5.0));
    }

    #[test]
    fn test_validate_logs_rules() {
        let logger = MockLogger::new();
        let engine = ComparisonEngine::new(
            FlowDataset::new(vec![make_record("10.0.0.1", "10.0.0.2", 0, 10, 5)]),
            FlowDataset::new(vec![make_record("10.0.0.1", "10.0.0.2", 0, 10, 5)]),
            GeneratorStats::default(),
            &ModelOptions::default(),
            Arc::new(logger.clone()),
        )
        .unwrap();

        engine
            .validate(&[Rule::new(vec![metric(MetricKind::Packets, 0.0)], None)], false)
            .unwrap();
        assert!(logger.contains("comparing 1 probe flows with 1 reference flows"));
        assert!(logger.contains("rule 0: 1 probe flows, 1 reference flows in ALL"));
    }

    // ===========================================
    // Complement
    // ===========================================

    #[test]
    fn test_complement_of_partition_is_empty() {
        let records = vec![
            make_record("10.0.0.1", "8.8.8.8", 0, 10, 5),
            make_record("192.168.0.1", "8.8.8.8", 0, 10, 7),
        ];
        let engine = make_engine(records.clone(), records);
        let rules = vec![
            Rule::new(vec![metric(MetricKind::Packets, 0.0)], Some(subnet("10.0.0.0/8"))),
            Rule::new(vec![metric(MetricKind::Packets, 0.0)], Some(subnet("192.168.0.0/16"))),
        ];

        let report = engine.validate(&rules, true).unwrap();
        assert_eq!(report.len(), 4);
        let complement: Vec<_> = report
            .outcomes()
            .iter()
            .filter(|o| o.scope == OutcomeScope::Complement)
            .collect();
        assert_eq!(complement.len(), 2);
        for outcome in complement {
            assert_eq!(outcome.value, 0.0);
            assert_eq!(outcome.reference, 0.0);
            assert!(outcome.is_passing());
        }
        assert!(report.is_passing());
    }

    #[test]
    fn test_complement_detects_leaked_traffic() {
        let records = vec![
            make_record("10.0.0.1", "8.8.8.8", 0, 10, 5),
            make_record("172.16.0.1", "1.1.1.1", 0, 10, 7),
        ];
        let engine = make_engine(records.clone(), records);
        let rules = vec![Rule::new(vec![metric(MetricKind::Packets, 0.0)], Some(subnet("10.0.0.0/8")))];

        let report = engine.validate(&rules, true).unwrap();
        let failed: Vec<_> = report.failed().collect();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].metric.kind(), MetricKind::Packets);
        assert_eq!(failed[0].value, 7.0);
        assert_eq!(failed[1].metric.kind(), MetricKind::Bytes);
        assert_eq!(failed[1].value, 700.0);
        assert_eq!(failed[1].diff, 1.0);
    }

    #[test]
    fn test_complement_with_time_segment() {
        let records = vec![
            make_record("10.0.0.1", "8.8.8.8", 0, 10, 5),
            make_record("10.0.0.1", "8.8.8.8", 100, 200, 7),
        ];
        let engine = make_engine(records.clone(), records);
        let segment: Segment = TimeSegment::new(None, Some(50)).unwrap().into();
        let rules = vec![Rule::new(vec![metric(MetricKind::Flows, 0.0)], Some(segment))];

        let report = engine.validate(&rules, true).unwrap();
        assert_eq!(report.outcomes()[1].value, 7.0);
        assert!(!report.is_passing());
    }

    // ===========================================
    // Preparation
    // ===========================================

    #[test]
    fn test_merge_option_merges_probe_flows() {
        let engine = ComparisonEngine::new(
            FlowDataset::new(vec![
                make_record("10.0.0.1", "10.0.0.2", 0, 10, 5),
                make_record("10.0.0.1", "10.0.0.2", 20, 30, 5),
            ]),
            FlowDataset::new(vec![make_record("10.0.0.1", "10.0.0.2", 0, 30, 10)]),
            GeneratorStats::default(),
            &ModelOptions::default().with_merge(true),
            null_logger(),
        )
        .unwrap();

        assert_eq!(engine.flows().len(), 1);
        assert_eq!(engine.flows().records()[0].flow_count, Some(2));
        let rule = Rule::zero_tolerance(&[MetricKind::Packets, MetricKind::Flows], None);
        assert!(engine.validate(&[rule], false).unwrap().is_passing());
    }

    #[test]
    fn test_merge_option_rejects_duplicate_reference() {
        let reference = vec![
            make_record("10.0.0.1", "10.0.0.2", 0, 10, 5),
            make_record("10.0.0.1", "10.0.0.2", 20, 30, 5),
        ];
        let result = ComparisonEngine::new(
            FlowDataset::default(),
            FlowDataset::new(reference),
            GeneratorStats::default(),
            &ModelOptions::default().with_merge(true),
            null_logger(),
        );
        assert!(matches!(result, Err(MergeError::DuplicateReferenceKey { count: 2, .. })));
    }

    #[test]
    fn test_reference_alignment() {
        let engine = ComparisonEngine::new(
            FlowDataset::new(vec![
                make_record("10.0.0.1", "10.0.0.2", 900, 950, 1),
                make_record("10.0.0.1", "10.0.0.2", 1100, 1500, 5),
            ]),
            FlowDataset::new(vec![make_record("10.0.0.1", "10.0.0.2", 100, 500, 5)]),
            GeneratorStats::new(1000, 2000, 5, 500),
            &ModelOptions::default().with_reference_alignment(true),
            null_logger(),
        )
        .unwrap();

        assert_eq!(engine.flows().len(), 1);
        let reference = &engine.reference().records()[0];
        assert_eq!((reference.start_time, reference.end_time), (1100, 1500));
    }

    #[test]
    fn test_alignment_disabled_by_default() {
        let engine = make_engine(
            vec![make_record("10.0.0.1", "10.0.0.2", 0, 10, 1)],
            vec![make_record("10.0.0.1", "10.0.0.2", 100, 500, 5)],
        );
        assert_eq!(engine.reference().records()[0].start_time, 100);
        assert_eq!(engine.flows().len(), 1);
    }
}

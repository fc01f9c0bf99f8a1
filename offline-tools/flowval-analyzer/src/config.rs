//! Engine options and configuration files.
//!
//! Rule files are YAML (JSON is accepted as well):
//!
//! ```yaml
//! rules:
//!   - metrics: [{ key: PACKETS, diff: 0.05 }, { key: FLOWS, diff: 0.1 }]
//!     segment: { source: 10.0.0.0/8, bidir: true }
//!   - metrics: [{ key: BYTES, diff: 0 }]
//!     segment: { start: "2023-05-01T10:00:00Z", end: 1682935300000 }
//! check_complement: true
//! ```

use crate::metric::{GeneratorStats, Metric, MetricKind, ToleranceRangeError};
use crate::model::{DuplicateMetricError, Rule};
use crate::segment::{Segment, SegmentError, SubnetSegment, TimeSegment};
use serde::Deserialize;
use std::path::Path;

/// Default for merging probe flows by flow key.
pub const DEFAULT_MERGE: bool = false;

/// Default for biflow timestamp correction.
pub const DEFAULT_BIFLOW_TS_CORRECTION: bool = false;

/// Default for aligning reference times to the generator start (opt-in).
pub const DEFAULT_ALIGN_REFERENCE: bool = false;

/// Default number of replay loops.
pub const DEFAULT_LOOPS: u32 = 1;

/// Default replay speed multiplier.
pub const DEFAULT_SPEED_MULTIPLIER: f64 = 1.0;

/// Comparison engine options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelOptions {
    /// Merge probe flows sharing a flow key.
    pub merge: bool,
    /// Align timestamps of both biflow directions after merging.
    pub biflow_ts_correction: bool,
    /// Treat reference times as offsets from the generator start.
    ///
    /// Off by default: reference times are taken as absolute even when the
    /// generator reports a non-zero start time. Enable it for references
    /// recorded relative to the start of the replay.
    pub align_reference: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            merge: DEFAULT_MERGE,
            biflow_ts_correction: DEFAULT_BIFLOW_TS_CORRECTION,
            align_reference: DEFAULT_ALIGN_REFERENCE,
        }
    }
}

impl ModelOptions {
    /// Builder: set merge.
    pub fn with_merge(mut self, merge: bool) -> Self {
        self.merge = merge;
        self
    }

    /// Builder: set biflow_ts_correction.
    pub fn with_biflow_ts_correction(mut self, correction: bool) -> Self {
        self.biflow_ts_correction = correction;
        self
    }

    /// Builder: set align_reference.
    pub fn with_reference_alignment(mut self, align: bool) -> Self {
        self.align_reference = align;
        self
    }
}

/// Replication options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplicateOptions {
    pub loops: u32,
    pub merge_across_loops: bool,
    /// Probe inactive timeout. `None` merges regardless of gaps.
    pub inactive_timeout_ms: Option<u64>,
    /// Replay speed; 2.0 plays twice as fast, 0.5 half as fast.
    pub speed_multiplier: f64,
}

impl Default for ReplicateOptions {
    fn default() -> Self {
        Self::new(DEFAULT_LOOPS)
    }
}

impl ReplicateOptions {
    /// Create options with defaults and the number of loops.
    pub fn new(loops: u32) -> Self {
        Self {
            loops,
            merge_across_loops: false,
            inactive_timeout_ms: None,
            speed_multiplier: DEFAULT_SPEED_MULTIPLIER,
        }
    }

    /// Builder: set merge_across_loops.
    pub fn with_merge_across_loops(mut self, merge: bool) -> Self {
        self.merge_across_loops = merge;
        self
    }

    /// Builder: set inactive_timeout_ms.
    pub fn with_inactive_timeout_ms(mut self, timeout: Option<u64>) -> Self {
        self.inactive_timeout_ms = timeout;
        self
    }

    /// Builder: set speed_multiplier.
    pub fn with_speed_multiplier(mut self, speed: f64) -> Self {
        self.speed_multiplier = speed;
        self
    }
}

/// Errors loading configuration files.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Tolerance(#[from] ToleranceRangeError),

    #[error(transparent)]
    DuplicateMetric(#[from] DuplicateMetricError),

    #[error(transparent)]
    Segment(#[from] SegmentError),
}

/// Rules parsed from a rule file.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub check_complement: bool,
}

impl RuleSet {
    /// Parse a YAML (or JSON) rule document.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: RulesFile = serde_yaml::from_str(content)?;
        file.try_into()
    }

    /// Load a rule file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::parse(&read_file(path)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RulesFile {
    rules: Vec<RuleSpec>,
    #[serde(default)]
    check_complement: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSpec {
    metrics: Vec<MetricSpec>,
    #[serde(default)]
    segment: Option<SegmentSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MetricSpec {
    key: MetricKind,
    diff: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SegmentSpec {
    Subnet(SubnetSpec),
    Time(TimeSpec),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubnetSpec {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    dest: Option<String>,
    #[serde(default)]
    bidir: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimeSpec {
    #[serde(default)]
    start: Option<TimeBound>,
    #[serde(default)]
    end: Option<TimeBound>,
}

/// Time bound as UTC milliseconds or an RFC 3339 timestamp.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TimeBound {
    Millis(u64),
    Text(String),
}

impl TimeBound {
    fn to_millis(&self) -> Result<u64, SegmentError> {
        match self {
            TimeBound::Millis(ms) => Ok(*ms),
            TimeBound::Text(text) => chrono::DateTime::parse_from_rfc3339(text.trim())
                .ok()
                .and_then(|dt| u64::try_from(dt.timestamp_millis()).ok())
                .ok_or_else(|| SegmentError::InvalidTime(text.clone())),
        }
    }
}

impl SegmentSpec {
    /// Segment without any bound means no segment.
    fn into_segment(self) -> Result<Option<Segment>, SegmentError> {
        match self {
            SegmentSpec::Subnet(spec) => {
                if spec.source.is_none() && spec.dest.is_none() {
                    return Ok(None);
                }
                let subnet = SubnetSegment::parse(spec.source.as_deref(), spec.dest.as_deref(), spec.bidir)?;
                Ok(Some(subnet.into()))
            }
            SegmentSpec::Time(spec) => {
                if spec.start.is_none() && spec.end.is_none() {
                    return Ok(None);
                }
                let start = spec.start.as_ref().map(TimeBound::to_millis).transpose()?;
                let end = spec.end.as_ref().map(TimeBound::to_millis).transpose()?;
                Ok(Some(TimeSegment::new(start, end)?.into()))
            }
        }
    }
}

impl TryFrom<RulesFile> for RuleSet {
    type Error = ConfigError;

    fn try_from(file: RulesFile) -> Result<Self, Self::Error> {
        let mut rules = Vec::with_capacity(file.rules.len());
        for spec in file.rules {
            let metrics = spec
                .metrics
                .iter()
                .map(|m| Metric::new(m.key, m.diff))
                .collect::<Result<Vec<_>, _>>()?;
            let segment = match spec.segment {
                Some(segment) => segment.into_segment()?,
                None => None,
            };
            let rule = Rule::new(metrics, segment);
            rule.check_distinct()?;
            rules.push(rule);
        }
        Ok(Self {
            rules,
            check_complement: file.check_complement,
        })
    }
}

/// Load generator statistics from a JSON file.
pub fn load_generator_stats(path: &Path) -> Result<GeneratorStats, ConfigError> {
    Ok(serde_json::from_str(&read_file(path)?)?)
}

/// Load an ft-replay style replicator configuration (YAML or JSON).
pub fn load_replicator_config(path: &Path) -> Result<serde_json::Value, ConfigError> {
    Ok(serde_yaml::from_str(&read_file(path)?)?)
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })
}

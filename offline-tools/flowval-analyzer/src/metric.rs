//! Metric evaluation over filtered datasets.
//!
//! Counters (packets, bytes, flows) compare the probe subset against the
//! reference subset. Rates and duration compare the probe subset against the
//! totals reported by the traffic generator.

use crate::dataset::FlowDataset;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of metric evaluated by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricKind {
    #[serde(rename = "PACKETS")]
    Packets,
    #[serde(rename = "BYTES")]
    Bytes,
    #[serde(rename = "FLOWS")]
    Flows,
    #[serde(rename = "PACKETS / S", alias = "PPS")]
    Pps,
    #[serde(rename = "MB / S", alias = "MBPS")]
    Mbps,
    #[serde(rename = "DURATION")]
    Duration,
}

impl MetricKind {
    /// Every kind, in report order.
    pub const ALL: [MetricKind; 6] = [
        MetricKind::Packets,
        MetricKind::Bytes,
        MetricKind::Flows,
        MetricKind::Pps,
        MetricKind::Mbps,
        MetricKind::Duration,
    ];

    /// Name used in rule files and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Packets => "PACKETS",
            MetricKind::Bytes => "BYTES",
            MetricKind::Flows => "FLOWS",
            MetricKind::Pps => "PACKETS / S",
            MetricKind::Mbps => "MB / S",
            MetricKind::Duration => "DURATION",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PACKETS" => Ok(MetricKind::Packets),
            "BYTES" => Ok(MetricKind::Bytes),
            "FLOWS" => Ok(MetricKind::Flows),
            "PACKETS / S" | "PPS" => Ok(MetricKind::Pps),
            "MB / S" | "MBPS" => Ok(MetricKind::Mbps),
            "DURATION" => Ok(MetricKind::Duration),
            other => Err(format!("unknown metric: {}", other)),
        }
    }
}

/// Tolerance outside of [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("tolerance of {kind} must be in range 0 - 1 (included), got {tolerance}")]
pub struct ToleranceRangeError {
    pub kind: MetricKind,
    pub tolerance: f64,
}

/// Errors computing a metric.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum MetricError {
    #[error("reference of {metric} is zero, relative difference of {value} is undefined")]
    ZeroReference { metric: MetricKind, value: f64 },
}

/// A metric together with its acceptable relative difference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metric {
    kind: MetricKind,
    tolerance: f64,
}

impl Metric {
    /// Create a metric, rejecting tolerances outside of [0, 1] (and NaN).
    pub fn new(kind: MetricKind, tolerance: f64) -> Result<Self, ToleranceRangeError> {
        if !(0.0..=1.0).contains(&tolerance) {
            return Err(ToleranceRangeError { kind, tolerance });
        }
        Ok(Self { kind, tolerance })
    }

    /// Metric that tolerates no difference at all.
    pub fn exact(kind: MetricKind) -> Self {
        Self { kind, tolerance: 0.0 }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }
}

/// Totals reported by the traffic generator for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GeneratorStats {
    /// Start of the run (UTC milliseconds).
    pub start_time: u64,
    /// End of the run (UTC milliseconds).
    pub end_time: u64,
    pub packets: u64,
    pub bytes: u64,
}

impl GeneratorStats {
    pub fn new(start_time: u64, end_time: u64, packets: u64, bytes: u64) -> Self {
        Self {
            start_time,
            end_time,
            packets,
            bytes,
        }
    }

    /// Run duration in seconds, `(end - start + 1) / 1000`.
    pub fn duration_sec(&self) -> f64 {
        (u128::from(self.end_time.saturating_sub(self.start_time)) + 1) as f64 / 1000.0
    }
}

/// Observed value, reference value and their relative difference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub value: f64,
    pub reference: f64,
    pub diff: f64,
}

/// Evaluate one metric over a filtered probe / reference pair.
pub fn evaluate(
    kind: MetricKind,
    flows: &FlowDataset,
    reference: &FlowDataset,
    stats: &GeneratorStats,
) -> Result<Measurement, MetricError> {
    let duration = flows.observed_duration_sec();
    let ref_duration = stats.duration_sec();

    match kind {
        MetricKind::Flows => count_measurement(kind, flows.len() as u128, reference.len() as u128),
        MetricKind::Packets => count_measurement(kind, flows.total_packets(), reference.total_packets()),
        MetricKind::Bytes => count_measurement(kind, flows.total_bytes(), reference.total_bytes()),
        MetricKind::Pps => real_measurement(
            kind,
            rate(flows.total_packets(), duration),
            rate(u128::from(stats.packets), ref_duration),
        ),
        MetricKind::Mbps => real_measurement(
            kind,
            rate(flows.total_bytes(), duration) / 1e6,
            rate(u128::from(stats.bytes), ref_duration) / 1e6,
        ),
        MetricKind::Duration => real_measurement(kind, duration, ref_duration),
    }
}

/// `|value - reference| / reference` over exact integer counters.
///
/// Counters are sums of 64-bit columns and are carried as `u128`.
pub fn count_difference(kind: MetricKind, value: u128, reference: u128) -> Result<f64, MetricError> {
    if reference == 0 {
        return Err(MetricError::ZeroReference {
            metric: kind,
            value: value as f64,
        });
    }
    Ok(value.abs_diff(reference) as f64 / reference as f64)
}

/// `|value - reference| / reference` over real numbers.
pub fn relative_difference(kind: MetricKind, value: f64, reference: f64) -> Result<f64, MetricError> {
    if reference == 0.0 {
        return Err(MetricError::ZeroReference { metric: kind, value });
    }
    Ok((value - reference).abs() / reference)
}

fn count_measurement(kind: MetricKind, value: u128, reference: u128) -> Result<Measurement, MetricError> {
    Ok(Measurement {
        value: value as f64,
        reference: reference as f64,
        diff: count_difference(kind, value, reference)?,
    })
}

fn real_measurement(kind: MetricKind, value: f64, reference: f64) -> Result<Measurement, MetricError> {
    Ok(Measurement {
        value,
        reference,
        diff: relative_difference(kind, value, reference)?,
    })
}

fn rate(total: u128, duration_sec: f64) -> f64 {
    if duration_sec > 0.0 {
        total as f64 / duration_sec
    } else {
        0.0
    }
}

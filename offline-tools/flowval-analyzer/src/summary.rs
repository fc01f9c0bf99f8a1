//! Machine-readable summary output (summary.json).
//!
//! Provides versioned, deterministic output for the external reporting layer.

use crate::report::{Report, TestOutcome};
use serde::{Deserialize, Serialize};

/// Current summary schema version.
pub const SUMMARY_VERSION: u32 = 1;

/// Machine-readable summary of a validation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Summary format version.
    pub summary_version: u32,
    /// Overall verdict.
    pub passed: bool,
    pub total_tests: usize,
    pub failed_tests: usize,
    /// Outcomes in evaluation order.
    pub outcomes: Vec<OutcomeSummary>,
}

/// One test outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub metric: String,
    pub segment: String,
    pub value: f64,
    pub reference: f64,
    pub diff: f64,
    pub tolerance: f64,
    pub passed: bool,
}

impl From<&TestOutcome> for OutcomeSummary {
    fn from(outcome: &TestOutcome) -> Self {
        Self {
            metric: outcome.metric.kind().to_string(),
            segment: outcome.scope.to_string(),
            value: outcome.value,
            reference: outcome.reference,
            diff: outcome.diff,
            tolerance: outcome.metric.tolerance(),
            passed: outcome.is_passing(),
        }
    }
}

impl Summary {
    /// Build a summary from a report.
    pub fn from_report(report: &Report) -> Self {
        Self {
            summary_version: SUMMARY_VERSION,
            passed: report.is_passing(),
            total_tests: report.len(),
            failed_tests: report.failed().count(),
            outcomes: report.outcomes().iter().map(OutcomeSummary::from).collect(),
        }
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

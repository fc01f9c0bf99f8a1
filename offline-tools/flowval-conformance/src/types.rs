//! Conformance types.

use flowval_analyzer::config::{ModelOptions, ReplicateOptions, DEFAULT_LOOPS, DEFAULT_SPEED_MULTIPLIER};
use flowval_analyzer::metric::GeneratorStats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fixture scenario metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioMeta {
    pub name: String,
    pub description: String,
    pub pipeline: Pipeline,
}

/// Pipeline a fixture exercises, with its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pipeline {
    Replicate {
        #[serde(default = "default_loops")]
        loops: u32,
        #[serde(default)]
        merge_across_loops: bool,
        #[serde(default)]
        inactive_timeout_ms: Option<u64>,
        #[serde(default = "default_speed")]
        speed_multiplier: f64,
        #[serde(default)]
        ignore_loops: Vec<u32>,
    },
    Compare {
        #[serde(default)]
        merge: bool,
        #[serde(default)]
        biflows: bool,
        #[serde(default)]
        align_reference: bool,
        #[serde(default)]
        precise: bool,
        #[serde(default)]
        prefilter: Vec<String>,
    },
}

fn default_loops() -> u32 {
    DEFAULT_LOOPS
}

fn default_speed() -> f64 {
    DEFAULT_SPEED_MULTIPLIER
}

impl Pipeline {
    /// Replication options, for replication scenarios.
    pub fn replicate_options(&self) -> Option<ReplicateOptions> {
        match self {
            Pipeline::Replicate {
                loops,
                merge_across_loops,
                inactive_timeout_ms,
                speed_multiplier,
                ..
            } => Some(
                ReplicateOptions::new(*loops)
                    .with_merge_across_loops(*merge_across_loops)
                    .with_inactive_timeout_ms(*inactive_timeout_ms)
                    .with_speed_multiplier(*speed_multiplier),
            ),
            Pipeline::Compare { .. } => None,
        }
    }

    /// Model options, for comparison scenarios.
    pub fn model_options(&self) -> Option<ModelOptions> {
        match self {
            Pipeline::Compare {
                merge,
                biflows,
                align_reference,
                ..
            } => Some(
                ModelOptions::default()
                    .with_merge(*merge)
                    .with_biflow_ts_correction(*biflows)
                    .with_reference_alignment(*align_reference),
            ),
            Pipeline::Replicate { .. } => None,
        }
    }

    /// Files this pipeline can produce.
    pub fn output_files(&self) -> &'static [&'static str] {
        match self {
            Pipeline::Replicate { .. } => &["replicated.csv"],
            Pipeline::Compare { .. } => &["report.md", "summary.json"],
        }
    }
}

/// Input files of a fixture.
#[derive(Debug, Clone)]
pub enum FixtureInputs {
    Replicate {
        input_csv: String,
        /// Null when the fixture has no replicator configuration.
        replicator_config: serde_json::Value,
    },
    Compare {
        flows_csv: String,
        reference_csv: String,
        stats: GeneratorStats,
        /// Absent for precise scenarios.
        rules_yaml: Option<String>,
    },
}

/// A loaded fixture ready for execution.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub meta: ScenarioMeta,
    pub inputs: FixtureInputs,
    /// Expected outputs keyed by file name.
    pub expected: BTreeMap<String, String>,
}

/// Result of a conformance check.
#[derive(Debug, Clone)]
pub struct ConformanceResult {
    pub fixture_name: String,
    pub passed: bool,
    pub diffs: Vec<FileDiff>,
}

impl ConformanceResult {
    /// Create a passing result.
    pub fn pass(fixture_name: &str) -> Self {
        Self {
            fixture_name: fixture_name.to_string(),
            passed: true,
            diffs: vec![],
        }
    }

    /// Create a failing result with diffs.
    pub fn fail(fixture_name: &str, diffs: Vec<FileDiff>) -> Self {
        Self {
            fixture_name: fixture_name.to_string(),
            passed: false,
            diffs,
        }
    }

    /// Whether `file` matched its expected content.
    pub fn matches(&self, file: &str) -> bool {
        !self.diffs.iter().any(|d| d.file == file)
    }
}

/// A diff between expected and actual content.
#[derive(Debug, Clone)]
pub struct FileDiff {
    pub file: String,
    pub expected_len: usize,
    pub actual_len: usize,
    pub first_diff_line: Option<usize>,
    pub expected_excerpt: Option<String>,
    pub actual_excerpt: Option<String>,
}

impl FileDiff {
    /// Create a new diff, or `None` when the contents are identical.
    pub fn new(file: &str, expected: &str, actual: &str) -> Option<Self> {
        if expected == actual {
            return None;
        }

        let expected_lines: Vec<&str> = expected.lines().collect();
        let actual_lines: Vec<&str> = actual.lines().collect();

        let mut first_diff_line = None;
        let mut expected_excerpt = None;
        let mut actual_excerpt = None;

        for (i, (e, a)) in expected_lines.iter().zip(actual_lines.iter()).enumerate() {
            if e != a {
                first_diff_line = Some(i + 1);
                expected_excerpt = Some(e.to_string());
                actual_excerpt = Some(a.to_string());
                break;
            }
        }

        // Line counts differ, or only line endings do
        if first_diff_line.is_none() {
            let line = expected_lines.len().min(actual_lines.len()) + 1;
            first_diff_line = Some(line);
            expected_excerpt = expected_lines.get(line - 1).map(|s| s.to_string());
            actual_excerpt = actual_lines.get(line - 1).map(|s| s.to_string());
        }

        Some(Self {
            file: file.to_string(),
            expected_len: expected.len(),
            actual_len: actual.len(),
            first_diff_line,
            expected_excerpt,
            actual_excerpt,
        })
    }
}

impl std::fmt::Display for FileDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: line {}: expected {:?}, got {:?} ({} vs {} bytes)",
            self.file,
            self.first_diff_line.unwrap_or(0),
            self.expected_excerpt.as_deref().unwrap_or(""),
            self.actual_excerpt.as_deref().unwrap_or(""),
            self.expected_len,
            self.actual_len,
        )
    }
}

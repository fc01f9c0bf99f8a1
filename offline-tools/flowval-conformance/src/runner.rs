//! Conformance runner for executing fixtures and comparing outputs.

use crate::loader::{load_fixture, load_fixture_from, LoadError};
use crate::types::{ConformanceResult, FileDiff, Fixture, FixtureInputs, Pipeline};
use flowval_analyzer::config::{ConfigError, RuleSet};
use flowval_analyzer::dataset::{DatasetError, FlowDataset};
use flowval_analyzer::logger::null_logger;
use flowval_analyzer::merge::MergeError;
use flowval_analyzer::model::{precise_rules, ComparisonEngine, ValidationError};
use flowval_analyzer::replicator::{ReplicationEngine, ReplicatorError};
use flowval_analyzer::summary::Summary;
use ipnetwork::IpNetwork;
use std::collections::BTreeMap;
use std::path::Path;

/// Errors that can occur during conformance runs.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to load fixture: {0}")]
    Load(#[from] LoadError),

    #[error("invalid fixture inputs for {0}")]
    InputMismatch(String),

    #[error("invalid prefilter subnet: {0}")]
    Prefilter(String),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Replicator(#[from] ReplicatorError),

    #[error("failed to serialize summary: {0}")]
    Summary(#[from] serde_json::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Output from running a fixture pipeline, keyed by file name.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    pub files: BTreeMap<String, String>,
}

/// Run a single fixture and return conformance result.
pub fn run_fixture(name: &str) -> Result<ConformanceResult, RunError> {
    let fixture = load_fixture(name)?;
    run_fixture_check(&fixture)
}

/// Run fixture check with loaded fixture data.
///
/// Only outputs with an expected file are compared.
pub fn run_fixture_check(fixture: &Fixture) -> Result<ConformanceResult, RunError> {
    let output = run_pipeline(fixture)?;

    let diffs: Vec<FileDiff> = fixture
        .expected
        .iter()
        .filter_map(|(file, expected)| {
            let actual = output.files.get(file).map(String::as_str).unwrap_or("");
            FileDiff::new(file, expected, actual)
        })
        .collect();

    if diffs.is_empty() {
        Ok(ConformanceResult::pass(&fixture.meta.name))
    } else {
        Ok(ConformanceResult::fail(&fixture.meta.name, diffs))
    }
}

/// Run the fixture's pipeline and return its outputs.
pub fn run_pipeline(fixture: &Fixture) -> Result<PipelineOutput, RunError> {
    match (&fixture.meta.pipeline, &fixture.inputs) {
        (
            Pipeline::Replicate { ignore_loops, .. },
            FixtureInputs::Replicate {
                input_csv,
                replicator_config,
            },
        ) => {
            let logger = null_logger();
            let input = FlowDataset::from_csv_str(input_csv, logger.as_ref())?;
            let engine = ReplicationEngine::new(replicator_config, ignore_loops, logger)?;
            let options = fixture
                .meta
                .pipeline
                .replicate_options()
                .ok_or_else(|| RunError::InputMismatch(fixture.meta.name.clone()))?;

            let replicated = engine.replicate(&input, &options)?;

            let mut files = BTreeMap::new();
            files.insert("replicated.csv".to_string(), replicated.to_csv_string()?);
            Ok(PipelineOutput { files })
        }
        (
            Pipeline::Compare { precise, prefilter, .. },
            FixtureInputs::Compare {
                flows_csv,
                reference_csv,
                stats,
                rules_yaml,
            },
        ) => {
            let rule_set = match (precise, rules_yaml) {
                (true, _) => {
                    let subnets: Vec<IpNetwork> = prefilter
                        .iter()
                        .map(|s| s.parse().map_err(|_| RunError::Prefilter(s.clone())))
                        .collect::<Result<_, _>>()?;
                    RuleSet {
                        check_complement: !subnets.is_empty(),
                        rules: precise_rules(&subnets),
                    }
                }
                (false, Some(yaml)) => RuleSet::parse(yaml)?,
                (false, None) => return Err(RunError::InputMismatch(fixture.meta.name.clone())),
            };
            let options = fixture
                .meta
                .pipeline
                .model_options()
                .ok_or_else(|| RunError::InputMismatch(fixture.meta.name.clone()))?;

            let logger = null_logger();
            let flows = FlowDataset::from_csv_str(flows_csv, logger.as_ref())?;
            let reference = FlowDataset::from_csv_str(reference_csv, logger.as_ref())?;
            let engine = ComparisonEngine::new(flows, reference, *stats, &options, logger)?;
            let report = engine.validate(&rule_set.rules, rule_set.check_complement)?;

            let mut summary_json = Summary::from_report(&report).to_json()?;
            summary_json.push('\n');

            let mut files = BTreeMap::new();
            files.insert("report.md".to_string(), report.render_markdown());
            files.insert("summary.json".to_string(), summary_json);
            Ok(PipelineOutput { files })
        }
        _ => Err(RunError::InputMismatch(fixture.meta.name.clone())),
    }
}

/// Generate expected outputs for a fixture and write them to `expected/`.
///
/// This is useful for creating the expected/ directory contents for new fixtures.
/// Files already present are overwritten; nothing else is added.
pub fn generate_expected_outputs(fixture_path: &Path) -> Result<(), RunError> {
    let name = fixture_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown");

    let fixture = load_fixture_from(fixture_path, name)?;
    let output = run_pipeline(&fixture)?;

    let expected_dir = fixture_path.join("expected");
    for file in fixture.expected.keys() {
        let path = expected_dir.join(file);
        let content = output.files.get(file).map(String::as_str).unwrap_or("");
        std::fs::write(&path, content).map_err(|e| RunError::Write {
            path: path.display().to_string(),
            source: e,
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScenarioMeta;
    use flowval_analyzer::metric::GeneratorStats;
    use serde_json::json;

    const HEADER: &str = "START_TIME,END_TIME,PROTOCOL,SRC_IP,DST_IP,SRC_PORT,DST_PORT,PACKETS,BYTES\n";

    fn replicate_fixture(loops: u32, config: serde_json::Value, expected: &str) -> Fixture {
        Fixture {
            meta: ScenarioMeta {
                name: "test".to_string(),
                description: "Test".to_string(),
                pipeline: Pipeline::Replicate {
                    loops,
                    merge_across_loops: false,
                    inactive_timeout_ms: None,
                    speed_multiplier: 1.0,
                    ignore_loops: vec![],
                },
            },
            inputs: FixtureInputs::Replicate {
                input_csv: format!("{HEADER}1000,2000,6,10.0.0.1,10.0.0.2,1,80,5,500\n"),
                replicator_config: config,
            },
            expected: BTreeMap::from([("replicated.csv".to_string(), expected.to_string())]),
        }
    }

    fn compare_fixture(rules_yaml: Option<&str>, precise: bool) -> Fixture {
        let csv = format!("{HEADER}1000,1999,6,10.0.0.1,10.0.0.2,1,80,5,500\n");
        Fixture {
            meta: ScenarioMeta {
                name: "cmp".to_string(),
                description: "Compare".to_string(),
                pipeline: Pipeline::Compare {
                    merge: false,
                    biflows: false,
                    align_reference: false,
                    precise,
                    prefilter: vec![],
                },
            },
            inputs: FixtureInputs::Compare {
                flows_csv: csv.clone(),
                reference_csv: csv,
                stats: GeneratorStats::new(1000, 1999, 5, 500),
                rules_yaml: rules_yaml.map(str::to_string),
            },
            expected: BTreeMap::new(),
        }
    }

    // ===========================================
    // Replication Pipeline
    // ===========================================

    #[test]
    fn test_run_pipeline_replicate() {
        let fixture = replicate_fixture(2, json!({ "loop": { "srcip": "addOffset(1)" } }), "");

        let output = run_pipeline(&fixture).unwrap();

        let csv = &output.files["replicated.csv"];
        assert_eq!(
            csv,
            &format!(
                "{HEADER}1000,2000,6,10.0.0.1,10.0.0.2,1,80,5,500\n2000,3000,6,10.0.0.2,10.0.0.2,1,80,5,500\n"
            )
        );
    }

    #[test]
    fn test_run_fixture_check_pass() {
        let expected = format!("{HEADER}1000,2000,6,10.0.0.1,10.0.0.2,1,80,5,500\n");
        let fixture = replicate_fixture(1, serde_json::Value::Null, &expected);

        let result = run_fixture_check(&fixture).unwrap();
        assert!(result.passed, "diffs: {:?}", result.diffs);
    }

    #[test]
    fn test_run_fixture_check_reports_diff() {
        let expected = format!("{HEADER}1000,2000,6,10.0.0.9,10.0.0.2,1,80,5,500\n");
        let fixture = replicate_fixture(1, serde_json::Value::Null, &expected);

        let result = run_fixture_check(&fixture).unwrap();
        assert!(!result.passed);
        assert!(!result.matches("replicated.csv"));
        assert_eq!(result.diffs[0].first_diff_line, Some(2));
    }

    #[test]
    fn test_run_pipeline_replicator_error() {
        let fixture = replicate_fixture(1, json!({ "bogus": 1 }), "");
        let result = run_pipeline(&fixture);
        assert!(matches!(result, Err(RunError::Replicator(_))));
    }

    // ===========================================
    // Comparison Pipeline
    // ===========================================

    #[test]
    fn test_run_pipeline_compare_with_rules() {
        let fixture = compare_fixture(Some("rules:\n  - metrics: [{ key: PACKETS, diff: 0 }]\n"), false);

        let output = run_pipeline(&fixture).unwrap();

        assert!(output.files["report.md"].contains("| PACKETS | ALL | 5 | 5 |"));
        let summary: Summary = serde_json::from_str(&output.files["summary.json"]).unwrap();
        assert!(summary.passed);
        assert_eq!(summary.total_tests, 1);
        assert!(output.files["summary.json"].ends_with("}\n"));
    }

    #[test]
    fn test_run_pipeline_compare_precise() {
        let fixture = compare_fixture(None, true);

        let output = run_pipeline(&fixture).unwrap();

        let summary: Summary = serde_json::from_str(&output.files["summary.json"]).unwrap();
        assert!(summary.passed);
        assert_eq!(summary.total_tests, 6);
    }

    #[test]
    fn test_run_pipeline_compare_missing_rules() {
        let fixture = compare_fixture(None, false);
        let result = run_pipeline(&fixture);
        assert!(matches!(result, Err(RunError::InputMismatch(_))));
    }

    #[test]
    fn test_run_pipeline_mismatched_inputs() {
        let mut fixture = compare_fixture(None, true);
        fixture.inputs = FixtureInputs::Replicate {
            input_csv: HEADER.to_string(),
            replicator_config: serde_json::Value::Null,
        };
        let result = run_pipeline(&fixture);
        assert!(matches!(result, Err(RunError::InputMismatch(_))));
    }
}

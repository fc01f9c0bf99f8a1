//! Fixture loading utilities.

use crate::types::{Fixture, FixtureInputs, Pipeline, ScenarioMeta};
use flowval_analyzer::metric::GeneratorStats;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Errors that can occur when loading fixtures.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("fixture not found: {0}")]
    NotFound(String),

    #[error("missing file in fixture: {0}")]
    MissingFile(String),

    #[error("failed to read file {path}: {source}")]
    ReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse JSON in {path}: {source}")]
    JsonError {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no expected outputs in fixture: {0}")]
    NoExpectedOutputs(String),

    #[error("unexpected output {file} in fixture {fixture}")]
    UnknownOutput { fixture: String, file: String },
}

/// Get the fixtures directory path.
///
/// By default, looks for `fixtures/` relative to the workspace root.
pub fn fixtures_dir() -> PathBuf {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let path = Path::new(&manifest_dir);

    // From offline-tools/flowval-conformance, go up two levels to the workspace root
    if path.ends_with("flowval-conformance") {
        path.parent()
            .and_then(|p| p.parent())
            .unwrap_or(path)
            .join("fixtures")
    } else {
        path.join("fixtures")
    }
}

/// List all available fixture names.
pub fn list_fixtures() -> Result<Vec<String>, LoadError> {
    let dir = fixtures_dir();
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut fixtures = Vec::new();
    for path in read_dir_paths(&dir)? {
        if path.is_dir() {
            if let Some(name) = path.file_name() {
                fixtures.push(name.to_string_lossy().to_string());
            }
        }
    }

    fixtures.sort();
    Ok(fixtures)
}

/// Load a fixture by name.
pub fn load_fixture(name: &str) -> Result<Fixture, LoadError> {
    let fixture_dir = fixtures_dir().join(name);
    if !fixture_dir.exists() {
        return Err(LoadError::NotFound(name.to_string()));
    }
    load_fixture_from(&fixture_dir, name)
}

/// Load a fixture from an explicit directory.
pub fn load_fixture_from(fixture_dir: &Path, name: &str) -> Result<Fixture, LoadError> {
    let meta: ScenarioMeta = load_json(&fixture_dir.join("scenario.json"))?;
    let inputs = load_inputs(fixture_dir, name, &meta.pipeline)?;
    let expected = load_expected_files(fixture_dir, name, &meta.pipeline)?;

    Ok(Fixture { meta, inputs, expected })
}

/// Load the input files the pipeline needs.
fn load_inputs(fixture_dir: &Path, name: &str, pipeline: &Pipeline) -> Result<FixtureInputs, LoadError> {
    match pipeline {
        Pipeline::Replicate { .. } => {
            let input_csv = read_required(fixture_dir, name, "input.csv")?;
            let config_path = fixture_dir.join("replicator.json");
            let replicator_config = if config_path.exists() {
                load_json(&config_path)?
            } else {
                serde_json::Value::Null
            };
            Ok(FixtureInputs::Replicate {
                input_csv,
                replicator_config,
            })
        }
        Pipeline::Compare { precise, .. } => {
            let flows_csv = read_required(fixture_dir, name, "flows.csv")?;
            let reference_csv = read_required(fixture_dir, name, "reference.csv")?;

            let stats_path = fixture_dir.join("stats.json");
            let stats = if stats_path.exists() {
                load_json(&stats_path)?
            } else {
                GeneratorStats::default()
            };

            let rules_yaml = if *precise {
                None
            } else {
                Some(read_required(fixture_dir, name, "rules.yaml")?)
            };

            Ok(FixtureInputs::Compare {
                flows_csv,
                reference_csv,
                stats,
                rules_yaml,
            })
        }
    }
}

/// Load every file in `expected/`.
///
/// Each file must be an output the pipeline produces.
fn load_expected_files(
    fixture_dir: &Path,
    name: &str,
    pipeline: &Pipeline,
) -> Result<BTreeMap<String, String>, LoadError> {
    let expected_dir = fixture_dir.join("expected");
    if !expected_dir.exists() {
        return Err(LoadError::MissingFile(format!("{}/expected/", name)));
    }

    let mut expected = BTreeMap::new();
    for path in read_dir_paths(&expected_dir)? {
        if !path.is_file() {
            continue;
        }
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !pipeline.output_files().contains(&file.as_str()) {
            return Err(LoadError::UnknownOutput {
                fixture: name.to_string(),
                file,
            });
        }
        expected.insert(file, read_file(&path)?);
    }

    if expected.is_empty() {
        return Err(LoadError::NoExpectedOutputs(name.to_string()));
    }
    Ok(expected)
}

fn read_required(fixture_dir: &Path, name: &str, file: &str) -> Result<String, LoadError> {
    let path = fixture_dir.join(file);
    if !path.exists() {
        return Err(LoadError::MissingFile(format!("{}/{}", name, file)));
    }
    read_file(&path)
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    let content = read_file(path)?;
    serde_json::from_str(&content).map_err(|e| LoadError::JsonError {
        path: path.display().to_string(),
        source: e,
    })
}

fn read_dir_paths(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let entries = std::fs::read_dir(dir).map_err(|e| LoadError::ReadError {
        path: dir.display().to_string(),
        source: e,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LoadError::ReadError {
            path: dir.display().to_string(),
            source: e,
        })?;
        paths.push(entry.path());
    }
    Ok(paths)
}

/// Read a file to string.
fn read_file(path: &Path) -> Result<String, LoadError> {
    std::fs::read_to_string(path).map_err(|e| LoadError::ReadError {
        path: path.display().to_string(),
        source: e,
    })
}

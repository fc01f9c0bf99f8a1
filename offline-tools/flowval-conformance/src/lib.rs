//! Flowval Conformance Harness
//!
//! Runs the replication and comparison engines over golden fixtures and
//! compares their output byte-for-byte, so that other implementations of the
//! validation tools can be checked against this one.
//!
//! # Fixtures
//!
//! Fixtures are stored in the `fixtures/` directory at the workspace root.
//! Each fixture is a directory containing:
//!
//! - `scenario.json` - Metadata and the pipeline to run
//! - Inputs of a replication scenario:
//!   - `input.csv` - Flows of one replay loop
//!   - `replicator.json` - Optional replicator configuration
//! - Inputs of a comparison scenario:
//!   - `flows.csv`, `reference.csv` - Probe and reference flows
//!   - `stats.json` - Optional generator statistics
//!   - `rules.yaml` - Rule file, unless the scenario is precise
//! - `expected/` - Expected outputs (`replicated.csv`, `report.md`,
//!   `summary.json`); only the files present are checked

pub mod loader;
pub mod runner;
pub mod types;

pub use loader::{fixtures_dir, list_fixtures, load_fixture, load_fixture_from, LoadError};
pub use runner::{generate_expected_outputs, run_fixture, run_fixture_check, run_pipeline, PipelineOutput, RunError};
pub use types::{ConformanceResult, FileDiff, Fixture, FixtureInputs, Pipeline, ScenarioMeta};

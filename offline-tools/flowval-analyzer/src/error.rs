//! Command-line errors and exit codes.

use crate::config::ConfigError;
use crate::dataset::DatasetError;
use crate::merge::MergeError;
use crate::model::ValidationError;
use crate::replicator::ReplicatorError;

/// Exit codes for the `flowval` binary.
pub mod codes {
    pub const SUCCESS: u8 = 0;
    pub const CONFIG_ERROR: u8 = 1;
    pub const INPUT_ERROR: u8 = 2;
    pub const DATA_ERROR: u8 = 3;
    pub const VALIDATION_FAILED: u8 = 4;
    pub const WRITE_FAILED: u8 = 5;
}

/// Errors surfaced by the command-line front end.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
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

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{failed} of {total} tests failed")]
    TestsFailed { failed: usize, total: usize },
}

/// Map an error to its exit code.
pub fn exit_code(err: &CliError) -> u8 {
    match err {
        CliError::Dataset(DatasetError::Read { .. }) => codes::INPUT_ERROR,
        CliError::Dataset(DatasetError::Write { .. }) => codes::WRITE_FAILED,
        CliError::Dataset(_) => codes::DATA_ERROR,
        CliError::Config(ConfigError::Read { .. }) => codes::INPUT_ERROR,
        CliError::Config(_) => codes::CONFIG_ERROR,
        CliError::Merge(_) => codes::DATA_ERROR,
        CliError::Validation(ValidationError::DuplicateMetric(_)) => codes::CONFIG_ERROR,
        CliError::Validation(_) => codes::DATA_ERROR,
        CliError::Replicator(ReplicatorError::CounterOverflow(_)) => codes::DATA_ERROR,
        CliError::Replicator(_) => codes::CONFIG_ERROR,
        CliError::InvalidArgument(_) => codes::CONFIG_ERROR,
        CliError::Write { .. } => codes::WRITE_FAILED,
        CliError::Json(_) => codes::WRITE_FAILED,
        CliError::TestsFailed { .. } => codes::VALIDATION_FAILED,
    }
}

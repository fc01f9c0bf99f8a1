//! Flow exporter validation, offline side.
//!
//! Two engines work on flow records stored as CSV:
//! - [`ComparisonEngine`] checks probe flows against reference flows using
//!   rules made of metrics with tolerances, optionally scoped to segments,
//!   and produces a [`Report`] with a pass/fail verdict.
//! - [`ReplicationEngine`] expands a recorded flow list into the flows a
//!   probe should observe when the recording is replayed in loops with
//!   rewritten addresses.
//!
//! Results are written as `report.md` for people and `summary.json` for
//! tooling.

pub mod config;
pub mod dataset;
pub mod error;
pub mod logger;
pub mod merge;
pub mod metric;
pub mod model;
pub mod replicator;
pub mod report;
pub mod segment;
pub mod summary;

pub use config::{ModelOptions, ReplicateOptions, RuleSet};
pub use dataset::{DatasetError, FlowDataset};
pub use error::{exit_code, CliError};
pub use logger::{Logger, SharedLogger, StderrLogger, Verbosity};
pub use metric::{GeneratorStats, Metric, MetricKind};
pub use model::{precise_rules, ComparisonEngine, Rule};
pub use replicator::{ReplicationEngine, ReplicatorConfig, ReplicatorError};
pub use report::{OutcomeScope, Report, TestOutcome};
pub use segment::{Segment, SubnetSegment, TimeSegment};
pub use summary::Summary;

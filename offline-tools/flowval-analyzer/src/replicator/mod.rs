//! Flow replication.
//!
//! Rebuilds the multi-loop reference a replaying traffic generator produced
//! from the single-loop reference it was given. The replay configuration
//! uses the ft-replay layout: replication `units` applied in every loop and a
//! `loop` section whose address offsets grow with the loop index.
//!
//! Only `addConstant(N)` and `addOffset(N)` address modifiers are supported.
//! `addCounter` spreads addresses over replay workers in a way that cannot be
//! reproduced offline.

use crate::merge::CounterOverflowError;

mod config;
mod cross_loop;
mod engine;

pub use config::{AddressModifier, LoopSelection, ReplicatorConfig, ReplicatorUnit};
pub use cross_loop::merge_across_loops;
pub use engine::ReplicationEngine;

/// Errors from parsing a replicator configuration or replicating flows.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplicatorError {
    #[error("value '{value}' of '{field}' is not supported by the flow replicator")]
    UnsupportedModifier { field: String, value: String },

    #[error("only 'units' and 'loop' keys are allowed in replicator configuration, found '{0}'")]
    UnknownConfigKey(String),

    #[error("invalid replicator configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid loopOnly value: {0}")]
    InvalidLoopOnly(String),

    #[error("speed multiplier must be a positive finite number, got {0}")]
    InvalidSpeed(f64),

    #[error(transparent)]
    CounterOverflow(#[from] CounterOverflowError),
}

//! flowval record schema
//!
//! Flow records as exported by a probe or synthesized by a traffic generator,
//! their identity keys, and the wrap-around address value used when
//! replicating traffic.

mod address;
mod record;

pub use address::{add_offset, IpValue, IPV6_OFFSET_SHIFT};
pub use record::{CsvFlowRow, DirectionInvariantKey, FlowKey, FlowRecord, RowError, CSV_COLUMNS};

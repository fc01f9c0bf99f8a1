//! Flow record, flow keys and the CSV row schema.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// CSV columns in export order.
pub const CSV_COLUMNS: [&str; 9] = [
    "START_TIME",
    "END_TIME",
    "PROTOCOL",
    "SRC_IP",
    "DST_IP",
    "SRC_PORT",
    "DST_PORT",
    "PACKETS",
    "BYTES",
];

/// One exported flow summary.
///
/// Timestamps are UTC milliseconds. `flow_count` is only set once records
/// have been merged and tells how many raw records were folded together.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowRecord {
    pub start_time: u64,
    pub end_time: u64,
    pub protocol: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub packets: u64,
    pub bytes: u64,
    pub flow_count: Option<u64>,
}

impl FlowRecord {
    /// Flow key of this record.
    pub fn key(&self) -> FlowKey {
        FlowKey {
            protocol: self.protocol,
            src_ip: self.src_ip,
            dst_ip: self.dst_ip,
            src_port: self.src_port,
            dst_port: self.dst_port,
        }
    }

    /// Direction invariant key of this record.
    pub fn invariant_key(&self) -> DirectionInvariantKey {
        self.key().direction_invariant()
    }

    /// Flow duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }
}

/// Direction specific identity of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub protocol: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    /// Canonical form with the smaller address first.
    ///
    /// Ports follow their addresses. Only used to align biflow timestamps.
    pub fn direction_invariant(&self) -> DirectionInvariantKey {
        let (src_ip, dst_ip, src_port, dst_port) = if self.src_ip > self.dst_ip {
            (self.dst_ip, self.src_ip, self.dst_port, self.src_port)
        } else {
            (self.src_ip, self.dst_ip, self.src_port, self.dst_port)
        };
        DirectionInvariantKey {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol: self.protocol,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "proto {} {}:{} -> {}:{}",
            self.protocol, self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Flow key with the endpoints in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectionInvariantKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

/// Raw CSV row as found on disk.
///
/// Addresses stay textual and ports may be blank until the row is
/// converted into a [`FlowRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CsvFlowRow {
    pub start_time: u64,
    pub end_time: u64,
    pub protocol: u8,
    pub src_ip: String,
    pub dst_ip: String,
    #[serde(default)]
    pub src_port: Option<u16>,
    #[serde(default)]
    pub dst_port: Option<u16>,
    pub packets: u64,
    pub bytes: u64,
}

impl CsvFlowRow {
    /// Convert to a typed record. Blank ports become 0.
    pub fn into_record(self) -> Result<FlowRecord, RowError> {
        let src_ip = parse_ip("SRC_IP", &self.src_ip)?;
        let dst_ip = parse_ip("DST_IP", &self.dst_ip)?;

        if self.end_time < self.start_time {
            return Err(RowError::InvertedTimestamps {
                start: self.start_time,
                end: self.end_time,
            });
        }

        Ok(FlowRecord {
            start_time: self.start_time,
            end_time: self.end_time,
            protocol: self.protocol,
            src_ip,
            dst_ip,
            src_port: self.src_port.unwrap_or(0),
            dst_port: self.dst_port.unwrap_or(0),
            packets: self.packets,
            bytes: self.bytes,
            flow_count: None,
        })
    }
}

impl From<&FlowRecord> for CsvFlowRow {
    fn from(record: &FlowRecord) -> Self {
        Self {
            start_time: record.start_time,
            end_time: record.end_time,
            protocol: record.protocol,
            src_ip: record.src_ip.to_string(),
            dst_ip: record.dst_ip.to_string(),
            src_port: Some(record.src_port),
            dst_port: Some(record.dst_port),
            packets: record.packets,
            bytes: record.bytes,
        }
    }
}

fn parse_ip(column: &'static str, value: &str) -> Result<IpAddr, RowError> {
    value.trim().parse().map_err(|_| RowError::InvalidAddress {
        column,
        value: value.to_string(),
    })
}

/// Errors converting a raw row into a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowError {
    #[error("invalid address in {column}: {value:?}")]
    InvalidAddress { column: &'static str, value: String },

    #[error("END_TIME {end} precedes START_TIME {start}")]
    InvertedTimestamps { start: u64, end: u64 },
}

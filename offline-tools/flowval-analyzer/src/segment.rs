//! Segment filtering.
//!
//! A segment narrows both the probe and the reference dataset to a subnet or
//! a time window before metrics are computed. Rules without a segment apply
//! to the whole dataset.

use crate::dataset::FlowDataset;
use flowval_schema::FlowRecord;
use ipnetwork::IpNetwork;
use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;

/// Errors from building segments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentError {
    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("invalid time bound: {0}")]
    InvalidTime(String),

    #[error("time segment start {start} is after end {end}")]
    InvertedTimeRange { start: u64, end: u64 },
}

/// Filter predicate for one comparison rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Subnet(SubnetSegment),
    Time(TimeSegment),
}

impl Segment {
    /// Check whether a single record falls into the segment.
    pub fn matches(&self, record: &FlowRecord) -> bool {
        match self {
            Segment::Subnet(subnet) => subnet.matches(record),
            Segment::Time(time) => time.matches(record),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Subnet(subnet) => write!(f, "{}", subnet),
            Segment::Time(time) => write!(f, "{}", time),
        }
    }
}

impl From<SubnetSegment> for Segment {
    fn from(segment: SubnetSegment) -> Self {
        Segment::Subnet(segment)
    }
}

impl From<TimeSegment> for Segment {
    fn from(segment: TimeSegment) -> Self {
        Segment::Time(segment)
    }
}

/// Source and/or destination subnet filter.
///
/// With `bidir` set, flows in the opposite direction match as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetSegment {
    pub source: Option<IpNetwork>,
    pub dest: Option<IpNetwork>,
    pub bidir: bool,
}

impl SubnetSegment {
    /// Create a segment from already parsed networks.
    pub fn new(source: Option<IpNetwork>, dest: Option<IpNetwork>, bidir: bool) -> Self {
        Self { source, dest, bidir }
    }

    /// Parse a segment from CIDR strings (e.g. "192.168.0.0/16").
    pub fn parse(source: Option<&str>, dest: Option<&str>, bidir: bool) -> Result<Self, SegmentError> {
        Ok(Self::new(
            source.map(parse_network).transpose()?,
            dest.map(parse_network).transpose()?,
            bidir,
        ))
    }

    /// Check whether a record matches.
    pub fn matches(&self, record: &FlowRecord) -> bool {
        self.matches_addresses(&record.src_ip, &record.dst_ip)
    }

    fn matches_addresses(&self, src: &IpAddr, dst: &IpAddr) -> bool {
        match (&self.source, &self.dest) {
            (Some(source), Some(dest)) => {
                let forward = source.contains(*src) && dest.contains(*dst);
                forward || (self.bidir && dest.contains(*src) && source.contains(*dst))
            }
            (Some(source), None) => {
                source.contains(*src) || (self.bidir && source.contains(*dst))
            }
            (None, Some(dest)) => dest.contains(*dst) || (self.bidir && dest.contains(*src)),
            (None, None) => true,
        }
    }
}

impl fmt::Display for SubnetSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let src = self.source.map(|n| n.to_string()).unwrap_or_else(|| "ANY".to_string());
        let dst = self.dest.map(|n| n.to_string()).unwrap_or_else(|| "ANY".to_string());
        let sign = if self.bidir { "<->" } else { "->" };
        write!(f, "{} {} {}", src, sign, dst)
    }
}

/// Time window filter in UTC milliseconds.
///
/// A flow matches when it starts at or after `start` and ends at or before
/// `end`. Unset bounds are not checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSegment {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl TimeSegment {
    /// Create a time segment, rejecting a start after the end.
    pub fn new(start: Option<u64>, end: Option<u64>) -> Result<Self, SegmentError> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(SegmentError::InvertedTimeRange { start, end });
            }
        }
        Ok(Self { start, end })
    }

    /// Check whether a record matches.
    pub fn matches(&self, record: &FlowRecord) -> bool {
        self.start.map_or(true, |start| record.start_time >= start)
            && self.end.map_or(true, |end| record.end_time <= end)
    }
}

impl fmt::Display for TimeSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.start.map(format_ms).unwrap_or_else(|| "ANY".to_string());
        let end = self.end.map(format_ms).unwrap_or_else(|| "ANY".to_string());
        write!(f, "{} -> {}", start, end)
    }
}

fn format_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn parse_network(value: &str) -> Result<IpNetwork, SegmentError> {
    value
        .trim()
        .parse::<IpNetwork>()
        .map_err(|_| SegmentError::InvalidSubnet(value.to_string()))
}

/// Subsets of both datasets selected by a segment.
#[derive(Debug, Clone)]
pub struct SegmentSelection<'a> {
    pub flows: Cow<'a, FlowDataset>,
    pub reference: Cow<'a, FlowDataset>,
    /// Selection over the probe-side rows, used for complement checks.
    pub mask: Vec<bool>,
}

/// Filter the probe and reference datasets by a segment.
///
/// Without a segment both datasets are returned unchanged together with an
/// all-true mask.
pub fn filter<'a>(
    flows: &'a FlowDataset,
    reference: &'a FlowDataset,
    segment: Option<&Segment>,
) -> SegmentSelection<'a> {
    match segment {
        None => SegmentSelection {
            flows: Cow::Borrowed(flows),
            reference: Cow::Borrowed(reference),
            mask: vec![true; flows.len()],
        },
        Some(segment) => {
            let mask = mask_of(flows, segment);
            let ref_mask = mask_of(reference, segment);
            SegmentSelection {
                flows: Cow::Owned(flows.select(&mask)),
                reference: Cow::Owned(reference.select(&ref_mask)),
                mask,
            }
        }
    }
}

/// Boolean selection of the rows of `dataset` that fall into `segment`.
pub fn mask_of(dataset: &FlowDataset, segment: &Segment) -> Vec<bool> {
    dataset.iter().map(|record| segment.matches(record)).collect()
}

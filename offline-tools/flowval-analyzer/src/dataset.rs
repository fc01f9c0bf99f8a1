//! Flow dataset loading and storage.
//!
//! A dataset is an ordered table of typed flow records. It is built once from
//! a CSV file (or an in-memory table) and never mutated afterwards: filtering,
//! merging and replication all produce new datasets.

use crate::logger::Logger;
use flowval_schema::{CsvFlowRow, FlowRecord, RowError, CSV_COLUMNS};
use rayon::prelude::*;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// Minimum number of rows a rayon task converts at once.
pub const PARSE_CHUNK_ROWS: usize = 4096;

/// Columns that must be present in every flow CSV. Ports may be missing.
const REQUIRED_COLUMNS: [&str; 7] = [
    "START_TIME",
    "END_TIME",
    "PROTOCOL",
    "SRC_IP",
    "DST_IP",
    "PACKETS",
    "BYTES",
];

/// Errors from loading or writing a dataset.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed flow CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("invalid record on line {line}: {source}")]
    InvalidRow {
        line: usize,
        #[source]
        source: RowError,
    },
}

/// Ordered, immutable table of flow records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowDataset {
    records: Vec<FlowRecord>,
}

impl FlowDataset {
    /// Build a dataset from an in-memory table.
    ///
    /// Broadcast and all-nodes multicast destinations are dropped the same
    /// way they are when loading from CSV.
    pub fn new(records: Vec<FlowRecord>) -> Self {
        let records = records
            .into_iter()
            .filter(|r| !is_noise_destination(&r.dst_ip))
            .collect();
        Self { records }
    }

    /// Wrap records produced by an engine from an already clean dataset.
    pub(crate) fn from_derived(records: Vec<FlowRecord>) -> Self {
        Self { records }
    }

    /// Load a dataset from a CSV file.
    pub fn load_csv(path: &Path, logger: &dyn Logger) -> Result<Self, DatasetError> {
        logger.debug(&format!("reading flows from {}", path.display()));
        let file = std::fs::File::open(path).map_err(|e| DatasetError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let dataset = Self::from_reader(file, logger)?;
        logger.verbose(&format!(
            "loaded {} flows from {}",
            dataset.len(),
            path.display()
        ));
        Ok(dataset)
    }

    /// Load a dataset from CSV content.
    pub fn from_csv_str(content: &str, logger: &dyn Logger) -> Result<Self, DatasetError> {
        Self::from_reader(content.as_bytes(), logger)
    }

    /// Load a dataset from any CSV reader.
    pub fn from_reader<R: Read>(reader: R, logger: &dyn Logger) -> Result<Self, DatasetError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv_reader.headers()?.clone();
        for column in REQUIRED_COLUMNS {
            if !headers.iter().any(|h| h == column) {
                return Err(DatasetError::MissingColumn(column.to_string()));
            }
        }

        let rows = csv_reader
            .deserialize::<CsvFlowRow>()
            .collect::<Result<Vec<_>, _>>()?;
        let total = rows.len();

        // Address parsing dominates load time; convert rows in parallel and
        // keep input order.
        let records = rows
            .into_par_iter()
            .with_min_len(PARSE_CHUNK_ROWS)
            .enumerate()
            .map(|(index, row)| {
                row.into_record().map_err(|source| DatasetError::InvalidRow {
                    // header is line 1
                    line: index + 2,
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let dataset = Self::new(records);
        let dropped = total - dataset.len();
        if dropped > 0 {
            logger.debug(&format!("dropped {} broadcast/multicast flows", dropped));
        }
        Ok(dataset)
    }

    /// Get all records in order.
    pub fn records(&self) -> &[FlowRecord] {
        &self.records
    }

    /// Consume the dataset and return its records.
    pub fn into_records(self) -> Vec<FlowRecord> {
        self.records
    }

    /// Iterate over records.
    pub fn iter(&self) -> impl Iterator<Item = &FlowRecord> {
        self.records.iter()
    }

    /// Get number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// New dataset holding the rows selected by `mask`, renumbered from zero.
    pub fn select(&self, mask: &[bool]) -> Self {
        debug_assert_eq!(mask.len(), self.records.len());
        let records = self
            .records
            .iter()
            .zip(mask)
            .filter(|(_, keep)| **keep)
            .map(|(record, _)| record.clone())
            .collect();
        Self { records }
    }

    /// New dataset holding the rows matching `predicate`.
    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&FlowRecord) -> bool,
    {
        Self {
            records: self.records.iter().filter(|r| predicate(r)).cloned().collect(),
        }
    }

    /// Sum of the PACKETS column. Wide enough for any number of full 64-bit counters.
    pub fn total_packets(&self) -> u128 {
        self.records.iter().map(|r| u128::from(r.packets)).sum()
    }

    /// Sum of the BYTES column.
    pub fn total_bytes(&self) -> u128 {
        self.records.iter().map(|r| u128::from(r.bytes)).sum()
    }

    /// Minimum start time and maximum end time, if any records exist.
    pub fn time_bounds(&self) -> Option<(u64, u64)> {
        let start = self.records.iter().map(|r| r.start_time).min()?;
        let end = self.records.iter().map(|r| r.end_time).max()?;
        Some((start, end))
    }

    /// Observed duration in seconds: `(max(end) - min(start) + 1) / 1000`.
    ///
    /// An empty dataset has no observed duration and reports 0.
    pub fn observed_duration_sec(&self) -> f64 {
        match self.time_bounds() {
            Some((start, end)) => (u128::from(end.saturating_sub(start)) + 1) as f64 / 1000.0,
            None => 0.0,
        }
    }

    /// Write the dataset as CSV with the standard header.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), DatasetError> {
        let mut csv_writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(writer);
        if self.records.is_empty() {
            csv_writer.write_record(CSV_COLUMNS)?;
        }
        for record in &self.records {
            csv_writer.serialize(CsvFlowRow::from(record))?;
        }
        csv_writer.flush().map_err(|e| DatasetError::Write {
            path: "<stream>".to_string(),
            source: e,
        })?;
        Ok(())
    }

    /// Render the dataset as a CSV string.
    pub fn to_csv_string(&self) -> Result<String, DatasetError> {
        let mut buffer = Vec::new();
        self.write_csv(&mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Save the dataset to a CSV file.
    pub fn save_csv(&self, path: &Path) -> Result<(), DatasetError> {
        let file = std::fs::File::create(path).map_err(|e| DatasetError::Write {
            path: path.display().to_string(),
            source: e,
        })?;
        self.write_csv(std::io::BufWriter::new(file))
    }
}

impl FromIterator<FlowRecord> for FlowDataset {
    fn from_iter<I: IntoIterator<Item = FlowRecord>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Destinations that are noise rather than flow data: limited broadcast and
/// IPv6 link-local all-nodes multicast (`ff02::/16`).
pub fn is_noise_destination(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => *v4 == Ipv4Addr::BROADCAST,
        IpAddr::V6(v6) => v6.segments()[0] == 0xff02,
    }
}

//! Replicator configuration parsing.

use super::ReplicatorError;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::OnceLock;

const UNITS_KEY: &str = "units";
const LOOP_KEY: &str = "loop";
const SRC_IP_KEY: &str = "srcip";
const DST_IP_KEY: &str = "dstip";
const LOOP_ONLY_KEY: &str = "loopOnly";

fn modifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(addConstant|addOffset)\(\s*([0-9]+)\s*\)\s*$").expect("valid modifier pattern")
    })
}

/// Constant added to an address.
///
/// Addresses are shifted modulo 2^32 (IPv4) or in their top 32 bits (IPv6),
/// so only the value modulo 2^32 is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressModifier {
    offset: u32,
}

impl AddressModifier {
    pub fn new(offset: u32) -> Self {
        Self { offset }
    }

    /// Reduce a decimal integer of any length modulo 2^32.
    pub fn from_decimal(digits: &str) -> Self {
        let offset = digits
            .bytes()
            .filter(u8::is_ascii_digit)
            .fold(0u64, |acc, d| (acc * 10 + u64::from(d - b'0')) & u64::from(u32::MAX));
        Self { offset: offset as u32 }
    }

    /// Offset added to an address.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Parse `addConstant(N)` or `addOffset(N)`.
    ///
    /// The string "None" and JSON null mean no modifier.
    pub fn parse(field: &str, value: &Value) -> Result<Option<Self>, ReplicatorError> {
        let text = match value {
            Value::Null => return Ok(None),
            Value::String(s) if s.trim() == "None" => return Ok(None),
            Value::String(s) => s.as_str(),
            other => {
                return Err(ReplicatorError::UnsupportedModifier {
                    field: field.to_string(),
                    value: other.to_string(),
                })
            }
        };

        let unsupported = || ReplicatorError::UnsupportedModifier {
            field: field.to_string(),
            value: text.to_string(),
        };
        let captures = modifier_pattern().captures(text).ok_or_else(unsupported)?;
        Ok(Some(Self::from_decimal(&captures[2])))
    }
}

/// Loops a unit is active in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoopSelection {
    #[default]
    All,
    Only(BTreeSet<u32>),
}

impl LoopSelection {
    /// Parse `"All"`, a single loop index or a list of indices.
    pub fn parse(value: &Value) -> Result<Self, ReplicatorError> {
        match value {
            Value::Null => Ok(LoopSelection::All),
            Value::String(s) if s == "All" => Ok(LoopSelection::All),
            Value::Number(_) => Ok(Self::from_indices([loop_index(value)?])),
            Value::Array(items) => {
                let indices = items.iter().map(loop_index).collect::<Result<BTreeSet<_>, _>>()?;
                Ok(Self::from_indices(indices))
            }
            other => Err(ReplicatorError::InvalidLoopOnly(other.to_string())),
        }
    }

    fn from_indices(indices: impl IntoIterator<Item = u32>) -> Self {
        let indices: BTreeSet<u32> = indices.into_iter().collect();
        if indices.is_empty() {
            LoopSelection::All
        } else {
            LoopSelection::Only(indices)
        }
    }

    /// Check whether loop `n` is selected.
    pub fn contains(&self, n: u32) -> bool {
        match self {
            LoopSelection::All => true,
            LoopSelection::Only(indices) => indices.contains(&n),
        }
    }

    /// True when every selected loop is in `ignored`.
    fn only_in(&self, ignored: &BTreeSet<u32>) -> bool {
        match self {
            LoopSelection::All => false,
            LoopSelection::Only(indices) => indices.is_subset(ignored),
        }
    }
}

fn loop_index(value: &Value) -> Result<u32, ReplicatorError> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| ReplicatorError::InvalidLoopOnly(value.to_string()))
}

/// One address perturbation applied to the replayed traffic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplicatorUnit {
    pub srcip: Option<AddressModifier>,
    pub dstip: Option<AddressModifier>,
    pub loop_only: LoopSelection,
}

impl ReplicatorUnit {
    /// Unit that leaves addresses unchanged in every loop.
    pub fn identity() -> Self {
        Self::default()
    }

    fn parse_modifiers(section: &Map<String, Value>, loop_only: LoopSelection) -> Result<Self, ReplicatorError> {
        let modifier = |key: &str| match section.get(key) {
            Some(value) => AddressModifier::parse(key, value),
            None => Ok(None),
        };
        Ok(Self {
            srcip: modifier(SRC_IP_KEY)?,
            dstip: modifier(DST_IP_KEY)?,
            loop_only,
        })
    }

    /// Source offset contributed by this unit.
    pub fn src_offset(&self) -> u32 {
        self.srcip.map_or(0, |m| m.offset())
    }

    /// Destination offset contributed by this unit.
    pub fn dst_offset(&self) -> u32 {
        self.dstip.map_or(0, |m| m.offset())
    }
}

/// Parsed replicator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatorConfig {
    /// Units applied in every loop they are active in.
    pub units: Vec<ReplicatorUnit>,
    /// Loop section; its offsets are multiplied by the loop index.
    pub loop_unit: ReplicatorUnit,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            units: vec![ReplicatorUnit::identity()],
            loop_unit: ReplicatorUnit::identity(),
        }
    }
}

impl ReplicatorConfig {
    /// Parse an ft-replay style configuration.
    ///
    /// Units active only in `ignore_loops` are dropped before their
    /// modifiers are parsed, so they may use modifiers that are otherwise
    /// rejected. A configuration listing no units replays the flows once per
    /// loop unchanged.
    pub fn parse(config: &Value, ignore_loops: &BTreeSet<u32>) -> Result<Self, ReplicatorError> {
        let empty = Map::new();
        let root = match config {
            Value::Null => &empty,
            Value::Object(map) => map,
            other => {
                return Err(ReplicatorError::InvalidConfig(format!(
                    "expected a mapping, got {}",
                    other
                )))
            }
        };

        if let Some(key) = root.keys().find(|k| *k != UNITS_KEY && *k != LOOP_KEY) {
            return Err(ReplicatorError::UnknownConfigKey(key.clone()));
        }

        let raw_units: Vec<&Value> = match root.get(UNITS_KEY) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().collect(),
            Some(other) => {
                return Err(ReplicatorError::InvalidConfig(format!(
                    "'units' must be a list, got {}",
                    other
                )))
            }
        };

        let mut units = Vec::with_capacity(raw_units.len());
        for raw in &raw_units {
            let section = as_section(UNITS_KEY, raw)?;
            let loop_only = match section.get(LOOP_ONLY_KEY) {
                Some(value) => LoopSelection::parse(value)?,
                None => LoopSelection::All,
            };
            if loop_only.only_in(ignore_loops) {
                continue;
            }
            units.push(ReplicatorUnit::parse_modifiers(section, loop_only)?);
        }
        if raw_units.is_empty() {
            units.push(ReplicatorUnit::identity());
        }

        let loop_unit = match root.get(LOOP_KEY) {
            None | Some(Value::Null) => ReplicatorUnit::identity(),
            Some(raw) => ReplicatorUnit::parse_modifiers(as_section(LOOP_KEY, raw)?, LoopSelection::All)?,
        };

        Ok(Self { units, loop_unit })
    }

    /// Units active in loop `n`, in configuration order.
    pub fn units_in_loop(&self, n: u32) -> impl Iterator<Item = &ReplicatorUnit> {
        self.units.iter().filter(move |u| u.loop_only.contains(n))
    }
}

fn as_section<'a>(name: &str, value: &'a Value) -> Result<&'a Map<String, Value>, ReplicatorError> {
    value
        .as_object()
        .ok_or_else(|| ReplicatorError::InvalidConfig(format!("'{}' entries must be mappings, got {}", name, value)))
}

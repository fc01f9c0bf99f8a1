//! Address value with wrap-around offset arithmetic.
//!
//! Replication perturbs addresses by adding integer offsets. IPv4 addresses
//! wrap modulo 2^32; IPv6 offsets are scaled by 2^96 so only the top 32 bits
//! change and the host part stays intact.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Number of bits an IPv6 offset is shifted by before it is added.
pub const IPV6_OFFSET_SHIFT: u32 = 96;

/// An IPv4 or IPv6 address backed by its numeric value.
///
/// Ordering is by family first (IPv4 < IPv6), then by numeric value, so
/// mixed-family record sets can be grouped and sorted safely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpValue {
    V4(u32),
    V6(u128),
}

impl IpValue {
    /// Add `offset` to the address, wrapping on overflow.
    ///
    /// Offsets are taken modulo 2^32. For IPv6 the reduced offset lands in
    /// the top 32 bits, which equals adding `offset * 2^96` modulo 2^128.
    pub fn wrapping_add(self, offset: u32) -> Self {
        match self {
            IpValue::V4(v) => IpValue::V4(v.wrapping_add(offset)),
            IpValue::V6(v) => IpValue::V6(v.wrapping_add((offset as u128) << IPV6_OFFSET_SHIFT)),
        }
    }

    /// Convert back to a standard library address.
    pub fn to_ip_addr(self) -> IpAddr {
        match self {
            IpValue::V4(v) => IpAddr::V4(Ipv4Addr::from(v)),
            IpValue::V6(v) => IpAddr::V6(Ipv6Addr::from(v)),
        }
    }
}

impl From<IpAddr> for IpValue {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => IpValue::V4(u32::from(v4)),
            IpAddr::V6(v6) => IpValue::V6(u128::from(v6)),
        }
    }
}

impl From<IpValue> for IpAddr {
    fn from(value: IpValue) -> Self {
        value.to_ip_addr()
    }
}

impl FromStr for IpValue {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<IpAddr>().map(IpValue::from)
    }
}

impl fmt::Display for IpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip_addr())
    }
}

/// Add an offset to a standard library address, wrapping on overflow.
pub fn add_offset(addr: IpAddr, offset: u32) -> IpAddr {
    IpValue::from(addr).wrapping_add(offset).to_ip_addr()
}

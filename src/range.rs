//! Inclusive address ranges.
//!
//! Addresses are compared on their canonical network-order bytes: 4 bytes for
//! IPv4, 16 for IPv6. Bytes compare unsigned. An IPv4 address always orders
//! before an IPv6 address, so a range never spans families unless its bounds do.

use std::cmp::Ordering;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Canonical byte form of an address.
#[must_use]
pub fn address_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Total order over canonical byte forms: shorter first, then unsigned lexicographic.
#[must_use]
pub fn compare_addresses(a: &IpAddr, b: &IpAddr) -> Ordering {
    let a = address_bytes(a);
    let b = address_bytes(b);
    a.len().cmp(&b.len()).then_with(|| a.cmp(&b))
}

/// Returns true iff `begin <= addr <= end`.
#[must_use]
pub fn within_range(addr: &IpAddr, begin: &IpAddr, end: &IpAddr) -> bool {
    compare_addresses(addr, begin) != Ordering::Less && compare_addresses(addr, end) != Ordering::Greater
}

/// An inclusive `[begin, end]` address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    /// First address in the range.
    pub begin: IpAddr,
    /// Last address in the range.
    pub end: IpAddr,
}

impl AddressRange {
    /// Builds a range.
    #[must_use]
    pub const fn new(begin: IpAddr, end: IpAddr) -> Self {
        Self { begin, end }
    }

    /// Returns true if `addr` lies within the range.
    #[must_use]
    pub fn contains(&self, addr: &IpAddr) -> bool {
        within_range(addr, &self.begin, &self.end)
    }
}

//! Inclusive address ranges.
//!
//! An [`AddressRange`] covers `[start, end]` for either IPv4 or IPv6. Both
//! bounds are held as `u128` ordinals internally so that the same arithmetic
//! serves both families and IPv6 ranges larger than 2^64 are sized exactly.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Converts an address to its unsigned ordinal.
pub fn ordinal(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(addr) => u128::from(u32::from(addr)),
        IpAddr::V6(addr) => u128::from(addr),
    }
}

/// An immutable inclusive address interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    start: IpAddr,
    end: IpAddr,
}

impl AddressRange {
    /// Creates a range from two addresses of the same family.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRange`] if the families differ, if
    /// `start > end`, or if the range spans the entire IPv6 space (its size
    /// is 2^128, one more than `u128` can represent).
    pub fn new(start: IpAddr, end: IpAddr) -> Result<Self> {
        if start.is_ipv4() != end.is_ipv4() {
            return Err(Error::InvalidRange(format!(
                "{start}-{end}: start and end must be the same address family"
            )));
        }
        if ordinal(start) > ordinal(end) {
            return Err(Error::InvalidRange(format!(
                "{start}-{end}: start must be less than or equal to end"
            )));
        }
        if start.is_ipv6() && ordinal(start) == 0 && ordinal(end) == u128::MAX {
            return Err(Error::InvalidRange(
                "a range may not cover the entire IPv6 address space".to_string(),
            ));
        }
        Ok(Self { start, end })
    }

    /// Creates an IPv4 range, ordering the bounds.
    pub fn v4(a: Ipv4Addr, b: Ipv4Addr) -> Self {
        let (start, end) = if a <= b { (a, b) } else { (b, a) };
        Self {
            start: IpAddr::V4(start),
            end: IpAddr::V4(end),
        }
    }

    /// Creates a range covering every address of a network, including the
    /// network and broadcast addresses.
    pub fn from_net(net: IpNet) -> Result<Self> {
        Self::new(net.network(), net.broadcast())
    }

    /// Parses `"start-end"`, a CIDR network, or a single address.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if let Some((start, end)) = text.split_once('-') {
            let start = parse_ip(start)?;
            let end = parse_ip(end)?;
            return Self::new(start, end);
        }
        if text.contains('/') {
            let net: IpNet = text
                .parse()
                .map_err(|_| Error::InvalidRange(format!("{text}: invalid network")))?;
            return Self::from_net(net);
        }
        let single = parse_ip(text)?;
        Self::new(single, single)
    }

    pub fn start(&self) -> IpAddr {
        self.start
    }

    pub fn end(&self) -> IpAddr {
        self.end
    }

    pub fn is_ipv4(&self) -> bool {
        self.start.is_ipv4()
    }

    pub fn start_ordinal(&self) -> u128 {
        ordinal(self.start)
    }

    pub fn end_ordinal(&self) -> u128 {
        ordinal(self.end)
    }

    /// Returns true if `ip` is of the range's family and lies within it.
    pub fn contains(&self, ip: IpAddr) -> bool {
        if ip.is_ipv4() != self.is_ipv4() {
            return false;
        }
        let value = ordinal(ip);
        value >= self.start_ordinal() && value <= self.end_ordinal()
    }

    /// Returns true if `ordinal` lies within the range.
    pub fn contains_ordinal(&self, value: u128) -> bool {
        value >= self.start_ordinal() && value <= self.end_ordinal()
    }

    /// Number of addresses in the range, `end - start + 1`.
    pub fn size(&self) -> u128 {
        self.end_ordinal() - self.start_ordinal() + 1
    }

    /// Converts an ordinal back to an address of this range's family.
    ///
    /// The ordinal is not checked against the range bounds.
    pub fn address(&self, value: u128) -> IpAddr {
        if self.is_ipv4() {
            IpAddr::V4(Ipv4Addr::from(value as u32))
        } else {
            IpAddr::V6(Ipv6Addr::from(value))
        }
    }

    /// Returns true if the two ranges share at least one address.
    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.is_ipv4() == other.is_ipv4()
            && self.start_ordinal() <= other.end_ordinal()
            && other.start_ordinal() <= self.end_ordinal()
    }

    /// Returns true if every address of `other` is inside this range.
    pub fn covers(&self, other: &AddressRange) -> bool {
        self.is_ipv4() == other.is_ipv4()
            && self.start_ordinal() <= other.start_ordinal()
            && other.end_ordinal() <= self.end_ordinal()
    }
}

fn parse_ip(text: &str) -> Result<IpAddr> {
    text.trim()
        .parse()
        .map_err(|_| Error::InvalidRange(format!("{}: invalid address", text.trim())))
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for AddressRange {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        Self::parse(text)
    }
}

impl Serialize for AddressRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AddressRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_parse_dash_range() {
        let range = AddressRange::parse("10.0.0.10-10.0.0.12").unwrap();
        assert_eq!(range.start(), v4(10, 0, 0, 10));
        assert_eq!(range.end(), v4(10, 0, 0, 12));
        assert_eq!(range.size(), 3);
        assert!(range.contains(v4(10, 0, 0, 11)));
        assert!(!range.contains(v4(10, 0, 0, 13)));
    }

    #[test]
    fn test_parse_cidr() {
        let range = AddressRange::parse("2001:db8::/64").unwrap();
        assert!(!range.is_ipv4());
        assert_eq!(range.size(), 1u128 << 64);
        assert!(range.contains("2001:db8::ffff".parse().unwrap()));
        assert!(!range.contains("2001:db8:0:1::".parse().unwrap()));
    }

    #[test]
    fn test_inverted_range_rejected() {
        assert!(AddressRange::parse("10.0.0.12-10.0.0.10").is_err());
    }

    #[test]
    fn test_mixed_family_rejected() {
        assert!(AddressRange::parse("10.0.0.1-2001:db8::1").is_err());
    }

    #[test]
    fn test_full_ipv6_space_rejected() {
        assert!(AddressRange::parse("::/0").is_err());
        let almost = AddressRange::parse("::1-ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff").unwrap();
        assert_eq!(almost.size(), u128::MAX);
    }

    #[test]
    fn test_contains_ignores_other_family() {
        let range = AddressRange::parse("0.0.0.0-255.255.255.255").unwrap();
        assert!(!range.contains("::1".parse().unwrap()));
        assert_eq!(range.size(), 1u128 << 32);
    }

    #[test]
    fn test_overlaps_and_covers() {
        let outer = AddressRange::parse("10.0.0.0/24").unwrap();
        let inner = AddressRange::parse("10.0.0.10-10.0.0.20").unwrap();
        let other = AddressRange::parse("10.0.0.15-10.0.1.5").unwrap();
        assert!(outer.covers(&inner));
        assert!(!inner.covers(&outer));
        assert!(inner.overlaps(&other));
        assert!(!outer.covers(&other));
    }

    #[test]
    fn test_serde_as_string() {
        let range = AddressRange::parse("192.168.1.100-192.168.1.200").unwrap();
        let json = serde_json::to_string(&range).unwrap();
        assert_eq!(json, "\"192.168.1.100-192.168.1.200\"");
        let back: AddressRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, range);
    }
}

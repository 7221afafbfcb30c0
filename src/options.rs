//! DHCP option values and the codes the lease engine acts on.
//!
//! The binary TLV grammar of individual options is handled by the wire codec
//! outside this crate. Here an option is a numeric code plus opaque data,
//! which is enough to look options up by code, to match them in filters, and
//! to persist them unchanged alongside a lease.
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions
//! - RFC 8415: Dynamic Host Configuration Protocol for IPv6

use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

/// A single DHCP option: code plus raw value.
///
/// The same type serves DHCPv4 (codes 0-255) and DHCPv6 (codes 0-65535).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpOption {
    pub code: u16,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl DhcpOption {
    pub fn new(code: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            data: data.into(),
        }
    }

    /// An option with an empty value (e.g. Rapid Commit).
    pub fn flag(code: u16) -> Self {
        Self {
            code,
            data: Vec::new(),
        }
    }

    pub fn u32_value(code: u16, value: u32) -> Self {
        Self::new(code, value.to_be_bytes())
    }

    /// Interprets the value as a big-endian `u32`.
    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.as_slice().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Interprets the value as text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Finds the first option with `code` in a list.
pub fn find_option(options: &[DhcpOption], code: u16) -> Option<&DhcpOption> {
    options.iter().find(|option| option.code == code)
}

/// Merges option lists where earlier lists take precedence by code.
///
/// Used to layer static-binding/pool options over link options over global
/// options.
pub fn merge_options<'a>(layers: impl IntoIterator<Item = &'a [DhcpOption]>) -> Vec<DhcpOption> {
    let mut merged: Vec<DhcpOption> = Vec::new();
    for layer in layers {
        for option in layer {
            if !merged.iter().any(|existing| existing.code == option.code) {
                merged.push(option.clone());
            }
        }
    }
    merged
}

/// DHCPv4 option codes as defined in RFC 2132 and extensions.
///
/// Only codes used by this implementation are defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum V4OptionCode {
    /// Subnet mask (RFC 2132 §3.3).
    SubnetMask = 1,
    /// Router/gateway addresses (RFC 2132 §3.5).
    Router = 3,
    /// Client hostname (RFC 2132 §3.14).
    Hostname = 12,
    /// Requested IP address (RFC 2132 §9.1).
    RequestedIpAddress = 50,
    /// IP address lease time in seconds (RFC 2132 §9.2).
    LeaseTime = 51,
    /// DHCP message type (RFC 2132 §9.6).
    MessageType = 53,
    /// Server identifier (RFC 2132 §9.7).
    ServerIdentifier = 54,
    /// Parameter request list (RFC 2132 §9.8).
    ParameterRequestList = 55,
    /// Renewal time T1 (RFC 2132 §9.11).
    RenewalTime = 58,
    /// Rebinding time T2 (RFC 2132 §9.12).
    RebindingTime = 59,
    /// Vendor class identifier (RFC 2132 §9.13).
    VendorClassIdentifier = 60,
    /// Client identifier (RFC 2132 §9.14).
    ClientIdentifier = 61,
    /// User class (RFC 3004).
    UserClass = 77,
    /// Rapid Commit (RFC 4039).
    RapidCommit = 80,
    /// Client FQDN (RFC 4702).
    ClientFqdn = 81,
    /// Relay agent information (RFC 3046).
    RelayAgentInfo = 82,
}

impl From<V4OptionCode> for u16 {
    fn from(code: V4OptionCode) -> Self {
        code as u16
    }
}

/// DHCPv6 option codes (RFC 8415 §21 and extensions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum V6OptionCode {
    ClientId = 1,
    ServerId = 2,
    IaNa = 3,
    IaTa = 4,
    IaAddr = 5,
    OptionRequest = 6,
    Preference = 7,
    ElapsedTime = 8,
    StatusCode = 13,
    RapidCommit = 14,
    UserClass = 15,
    VendorClass = 16,
    ServerUnicast = 12,
    DnsServers = 23,
    DomainList = 24,
    IaPd = 25,
    IaPrefix = 26,
    ClientFqdn = 39,
}

impl From<V6OptionCode> for u16 {
    fn from(code: V6OptionCode) -> Self {
        code as u16
    }
}

impl TryFrom<u16> for V6OptionCode {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ClientId),
            2 => Ok(Self::ServerId),
            3 => Ok(Self::IaNa),
            4 => Ok(Self::IaTa),
            5 => Ok(Self::IaAddr),
            6 => Ok(Self::OptionRequest),
            7 => Ok(Self::Preference),
            8 => Ok(Self::ElapsedTime),
            12 => Ok(Self::ServerUnicast),
            13 => Ok(Self::StatusCode),
            14 => Ok(Self::RapidCommit),
            15 => Ok(Self::UserClass),
            16 => Ok(Self::VendorClass),
            23 => Ok(Self::DnsServers),
            24 => Ok(Self::DomainList),
            25 => Ok(Self::IaPd),
            26 => Ok(Self::IaPrefix),
            39 => Ok(Self::ClientFqdn),
            other => Err(other),
        }
    }
}

/// DHCPv6 status codes (RFC 8415 §21.13).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum StatusCode {
    Success = 0,
    UnspecFail = 1,
    NoAddrsAvail = 2,
    NoBinding = 3,
    NotOnLink = 4,
    UseMulticast = 5,
    NoPrefixAvail = 6,
}

impl TryFrom<u16> for StatusCode {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::UnspecFail),
            2 => Ok(Self::NoAddrsAvail),
            3 => Ok(Self::NoBinding),
            4 => Ok(Self::NotOnLink),
            5 => Ok(Self::UseMulticast),
            6 => Ok(Self::NoPrefixAvail),
            other => Err(other),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::UnspecFail => write!(f, "UnspecFail"),
            Self::NoAddrsAvail => write!(f, "NoAddrsAvail"),
            Self::NoBinding => write!(f, "NoBinding"),
            Self::NotOnLink => write!(f, "NotOnLink"),
            Self::UseMulticast => write!(f, "UseMulticast"),
            Self::NoPrefixAvail => write!(f, "NoPrefixAvail"),
        }
    }
}

/// A status code option with its human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusOption {
    pub code: StatusCode,
    pub message: String,
}

impl StatusOption {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Builds a DHCPv6 Server Unicast option (RFC 8415 §21.12).
pub fn server_unicast_option(address: Ipv6Addr) -> DhcpOption {
    DhcpOption::new(V6OptionCode::ServerUnicast.into(), address.octets())
}

/// Extracts the domain name from a Client FQDN option value.
///
/// DHCPv6 (RFC 4704) and DHCPv4 (RFC 4702) both prefix the name with a
/// flags byte; v4 adds two deprecated RCODE bytes. The name itself is either
/// DNS wire format or, for old v4 clients, plain ASCII.
pub fn fqdn_from_option(option: &DhcpOption, v4: bool) -> Option<String> {
    let skip = if v4 { 3 } else { 1 };
    let name = option.data.get(skip..)?;
    if name.is_empty() {
        return None;
    }
    let encoded = v4 && option.data[0] & 0x04 == 0;
    if encoded {
        return std::str::from_utf8(name)
            .ok()
            .map(|text| text.trim_end_matches('.').to_string());
    }

    let mut labels = Vec::new();
    let mut index = 0;
    while index < name.len() {
        let length = name[index] as usize;
        if length == 0 {
            break;
        }
        let label = name.get(index + 1..index + 1 + length)?;
        labels.push(std::str::from_utf8(label).ok()?.to_string());
        index += 1 + length;
    }
    if labels.is_empty() {
        None
    } else {
        Some(labels.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_value_round_trip() {
        let option = DhcpOption::u32_value(V4OptionCode::LeaseTime.into(), 3600);
        assert_eq!(option.code, 51);
        assert_eq!(option.as_u32(), Some(3600));
        assert_eq!(DhcpOption::new(51, vec![1, 2]).as_u32(), None);
    }

    #[test]
    fn test_merge_options_prefers_earlier_layers() {
        let pool = vec![DhcpOption::new(23, vec![1])];
        let link = vec![DhcpOption::new(23, vec![2]), DhcpOption::new(24, vec![3])];
        let global = vec![DhcpOption::new(24, vec![4]), DhcpOption::new(7, vec![5])];

        let merged = merge_options([pool.as_slice(), link.as_slice(), global.as_slice()]);
        assert_eq!(merged.len(), 3);
        assert_eq!(find_option(&merged, 23).unwrap().data, vec![1]);
        assert_eq!(find_option(&merged, 24).unwrap().data, vec![3]);
        assert_eq!(find_option(&merged, 7).unwrap().data, vec![5]);
    }

    #[test]
    fn test_status_code_conversion() {
        assert_eq!(StatusCode::try_from(3), Ok(StatusCode::NoBinding));
        assert_eq!(StatusCode::try_from(42), Err(42));
        assert_eq!(StatusCode::UseMulticast.to_string(), "UseMulticast");
    }

    #[test]
    fn test_fqdn_wire_format() {
        let mut data = vec![0x01];
        data.extend_from_slice(&[4, b'h', b'o', b's', b't', 7]);
        data.extend_from_slice(b"example");
        data.push(0);
        let option = DhcpOption::new(V6OptionCode::ClientFqdn.into(), data);
        assert_eq!(
            fqdn_from_option(&option, false).as_deref(),
            Some("host.example")
        );
    }

    #[test]
    fn test_fqdn_v4_ascii() {
        let mut data = vec![0x01, 0, 0];
        data.extend_from_slice(b"laptop.lan.");
        let option = DhcpOption::new(V4OptionCode::ClientFqdn.into(), data);
        assert_eq!(fqdn_from_option(&option, true).as_deref(), Some("laptop.lan"));
    }

    #[test]
    fn test_option_serde_round_trip() {
        let option = DhcpOption::new(23, vec![0x20, 0x01]);
        let json = serde_json::to_string(&option).unwrap();
        let back: DhcpOption = serde_json::from_str(&json).unwrap();
        assert_eq!(back, option);
    }
}

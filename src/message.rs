//! Decoded DHCPv4 and DHCPv6 messages.
//!
//! These are the structures the wire codec hands to the engine and receives
//! back as replies. Field layout follows RFC 2131 §2 for DHCPv4 and
//! RFC 8415 §8/§21 for DHCPv6, but nothing here touches bytes on the wire:
//! IA options arrive already split into their addresses and prefixes, and
//! every other option is a [`DhcpOption`] looked up by code.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::options::{
    DhcpOption, StatusOption, V4OptionCode, V6OptionCode, find_option, fqdn_from_option,
};

/// BOOTP/DHCP operation code for client requests.
pub const BOOTREQUEST: u8 = 1;

/// BOOTP/DHCP operation code for server replies.
pub const BOOTREPLY: u8 = 2;

/// Hardware type for Ethernet (most common).
pub const HTYPE_ETHERNET: u8 = 1;

/// Hardware address length for Ethernet (6 bytes).
pub const HLEN_ETHERNET: u8 = 6;

/// Opaque client identity: a DHCPv6 DUID or a DHCPv4 client identifier.
///
/// Displayed and serialized as colon-separated lowercase hex, e.g.
/// `01:aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Vec<u8>);

impl ClientId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Builds the DHCPv4 identifier used when a client sends no option 61:
    /// hardware type followed by the hardware address.
    pub fn from_hardware(htype: u8, chaddr: &[u8]) -> Self {
        let mut id = Vec::with_capacity(chaddr.len() + 1);
        id.push(htype);
        id.extend_from_slice(chaddr);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for ClientId {
    type Err = Error;

    /// Parses hex separated by `:` or `-`, or a plain hex string.
    fn from_str(text: &str) -> Result<Self> {
        let normalized = text.trim().to_lowercase().replace('-', ":");
        let parts: Vec<String> = if normalized.contains(':') {
            normalized.split(':').map(str::to_string).collect()
        } else {
            if normalized.len() % 2 != 0 {
                return Err(Error::InvalidAddress(format!("{text}: odd number of hex digits")));
            }
            normalized
                .as_bytes()
                .chunks(2)
                .map(|pair| String::from_utf8_lossy(pair).into_owned())
                .collect()
        };

        let mut bytes = Vec::with_capacity(parts.len());
        for part in parts {
            let byte = u8::from_str_radix(&part, 16)
                .map_err(|_| Error::InvalidAddress(format!("{text}: invalid hex byte '{part}'")))?;
            bytes.push(byte);
        }
        if bytes.is_empty() {
            return Err(Error::InvalidAddress("empty identifier".to_string()));
        }
        Ok(Self(bytes))
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// DHCPv4 message types (Option 53) as defined in RFC 2132 §9.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum V4MessageType {
    /// Client broadcast to locate servers.
    Discover = 1,
    /// Server response to DISCOVER with IP offer.
    Offer = 2,
    /// Client request for offered parameters.
    Request = 3,
    /// Client indicates address is already in use.
    Decline = 4,
    /// Server acknowledgement with configuration.
    Ack = 5,
    /// Server negative acknowledgement.
    Nak = 6,
    /// Client releases IP address.
    Release = 7,
    /// Client requests config without IP allocation.
    Inform = 8,
}

impl TryFrom<u8> for V4MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl fmt::Display for V4MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// DHCPv6 message types (RFC 8415 §7.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum V6MessageType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Confirm = 4,
    Renew = 5,
    Rebind = 6,
    Reply = 7,
    Release = 8,
    Decline = 9,
    Reconfigure = 10,
    InformationRequest = 11,
    RelayForw = 12,
    RelayRepl = 13,
}

impl TryFrom<u8> for V6MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Solicit),
            2 => Ok(Self::Advertise),
            3 => Ok(Self::Request),
            4 => Ok(Self::Confirm),
            5 => Ok(Self::Renew),
            6 => Ok(Self::Rebind),
            7 => Ok(Self::Reply),
            8 => Ok(Self::Release),
            9 => Ok(Self::Decline),
            10 => Ok(Self::Reconfigure),
            11 => Ok(Self::InformationRequest),
            12 => Ok(Self::RelayForw),
            13 => Ok(Self::RelayRepl),
            other => Err(other),
        }
    }
}

impl fmt::Display for V6MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Solicit => "SOLICIT",
            Self::Advertise => "ADVERTISE",
            Self::Request => "REQUEST",
            Self::Confirm => "CONFIRM",
            Self::Renew => "RENEW",
            Self::Rebind => "REBIND",
            Self::Reply => "REPLY",
            Self::Release => "RELEASE",
            Self::Decline => "DECLINE",
            Self::Reconfigure => "RECONFIGURE",
            Self::InformationRequest => "INFORMATION-REQUEST",
            Self::RelayForw => "RELAY-FORW",
            Self::RelayRepl => "RELAY-REPL",
        };
        f.write_str(name)
    }
}

/// How a DHCPv6 message reached the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Sent to All_DHCP_Relay_Agents_and_Servers or forwarded by a relay.
    #[default]
    Multicast,
    /// Sent directly to one of the server's unicast addresses.
    Unicast,
}

/// An IA Address option (RFC 8415 §21.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaAddressOption {
    pub address: Ipv6Addr,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    pub options: Vec<DhcpOption>,
    pub status: Option<StatusOption>,
}

impl IaAddressOption {
    pub fn new(address: Ipv6Addr) -> Self {
        Self {
            address,
            preferred_lifetime: 0,
            valid_lifetime: 0,
            options: Vec::new(),
            status: None,
        }
    }
}

/// An IA Prefix option (RFC 8415 §21.22).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaPrefixOption {
    pub prefix: Ipv6Addr,
    pub prefix_length: u8,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    pub options: Vec<DhcpOption>,
    pub status: Option<StatusOption>,
}

impl IaPrefixOption {
    pub fn new(prefix: Ipv6Addr, prefix_length: u8) -> Self {
        Self {
            prefix,
            prefix_length,
            preferred_lifetime: 0,
            valid_lifetime: 0,
            options: Vec::new(),
            status: None,
        }
    }
}

/// An IA_NA, IA_TA, or IA_PD option.
///
/// IA_TA carries no T1/T2 on the wire; those fields stay zero.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IaOption {
    pub iaid: u32,
    pub t1: u32,
    pub t2: u32,
    pub addresses: Vec<IaAddressOption>,
    pub prefixes: Vec<IaPrefixOption>,
    pub options: Vec<DhcpOption>,
    pub status: Option<StatusOption>,
}

impl IaOption {
    pub fn new(iaid: u32) -> Self {
        Self {
            iaid,
            ..Default::default()
        }
    }

    pub fn with_status(iaid: u32, status: StatusOption) -> Self {
        Self {
            iaid,
            status: Some(status),
            ..Default::default()
        }
    }

    /// Every address or prefix carried by this IA.
    pub fn hinted_addresses(&self) -> Vec<IpAddr> {
        self.addresses
            .iter()
            .map(|addr| IpAddr::V6(addr.address))
            .chain(self.prefixes.iter().map(|prefix| IpAddr::V6(prefix.prefix)))
            .collect()
    }
}

/// A decoded DHCPv6 client/server message.
///
/// Replies are built with [`reply_to`](Self::reply_to) and then populated by
/// a message processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpV6Message {
    pub msg_type: V6MessageType,
    /// 24-bit transaction id.
    pub transaction_id: u32,
    pub client_id: Option<ClientId>,
    pub server_id: Option<ClientId>,
    pub ia_nas: Vec<IaOption>,
    pub ia_tas: Vec<IaOption>,
    pub ia_pds: Vec<IaOption>,
    /// Message-level status code.
    pub status: Option<StatusOption>,
    /// Every other option, in arrival order.
    pub options: Vec<DhcpOption>,
    pub delivery: Delivery,
    /// Link address from the innermost Relay-Forward, if relayed.
    pub link_address: Option<Ipv6Addr>,
    /// Source address of the client (peer address when relayed).
    pub peer_address: Option<Ipv6Addr>,
}

impl DhcpV6Message {
    pub fn new(msg_type: V6MessageType, transaction_id: u32) -> Self {
        Self {
            msg_type,
            transaction_id: transaction_id & 0x00ff_ffff,
            client_id: None,
            server_id: None,
            ia_nas: Vec::new(),
            ia_tas: Vec::new(),
            ia_pds: Vec::new(),
            status: None,
            options: Vec::new(),
            delivery: Delivery::Multicast,
            link_address: None,
            peer_address: None,
        }
    }

    /// Creates an empty reply that echoes the transaction id, the client id
    /// and the relay addressing of `request`.
    pub fn reply_to(request: &DhcpV6Message, msg_type: V6MessageType, server_id: ClientId) -> Self {
        Self {
            client_id: request.client_id.clone(),
            server_id: Some(server_id),
            link_address: request.link_address,
            peer_address: request.peer_address,
            ..Self::new(msg_type, request.transaction_id)
        }
    }

    /// Returns the first option with the given code.
    pub fn option(&self, code: u16) -> Option<&DhcpOption> {
        find_option(&self.options, code)
    }

    pub fn has_option(&self, code: impl Into<u16>) -> bool {
        self.option(code.into()).is_some()
    }

    pub fn is_unicast(&self) -> bool {
        self.delivery == Delivery::Unicast
    }

    pub fn rapid_commit(&self) -> bool {
        self.has_option(V6OptionCode::RapidCommit)
    }

    /// The domain name from the Client FQDN option, if present.
    pub fn fqdn(&self) -> Option<String> {
        self.option(V6OptionCode::ClientFqdn.into())
            .and_then(|option| fqdn_from_option(option, false))
    }

    /// Option codes from the Option Request option (ORO).
    pub fn requested_option_codes(&self) -> Vec<u16> {
        self.option(V6OptionCode::OptionRequest.into())
            .map(|option| {
                option
                    .data
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_ias(&self) -> bool {
        !self.ia_nas.is_empty() || !self.ia_tas.is_empty() || !self.ia_pds.is_empty()
    }
}

/// A decoded DHCPv4 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpV4Message {
    /// Operation code: [`BOOTREQUEST`] (1) or [`BOOTREPLY`] (2).
    pub op: u8,
    /// Hardware address type. [`HTYPE_ETHERNET`] (1) for Ethernet.
    pub htype: u8,
    /// Hardware address length. [`HLEN_ETHERNET`] (6) for Ethernet.
    pub hlen: u8,
    /// Transaction ID chosen by client, echoed in replies.
    pub xid: u32,
    /// Flags. Bit 15 (0x8000) = broadcast flag.
    pub flags: u16,
    /// Client IP address (set by client in RENEWING/REBINDING states).
    pub ciaddr: Ipv4Addr,
    /// "Your" IP address - the address being assigned to the client.
    pub yiaddr: Ipv4Addr,
    /// Server IP address.
    pub siaddr: Ipv4Addr,
    /// Gateway IP address - set by relay agents.
    pub giaddr: Ipv4Addr,
    /// Client hardware address (MAC for Ethernet).
    pub chaddr: [u8; 16],
    /// DHCP options.
    pub options: Vec<DhcpOption>,
}

impl DhcpV4Message {
    /// Creates an Ethernet BOOTREQUEST carrying `msg_type`.
    pub fn request(msg_type: V4MessageType, mac: [u8; 6], xid: u32) -> Self {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);
        Self {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            xid,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: vec![DhcpOption::new(
                V4OptionCode::MessageType.into(),
                vec![msg_type as u8],
            )],
        }
    }

    pub fn option(&self, code: impl Into<u16>) -> Option<&DhcpOption> {
        find_option(&self.options, code.into())
    }

    fn ipv4_option(&self, code: V4OptionCode) -> Option<Ipv4Addr> {
        let data = &self.option(code)?.data;
        let octets: [u8; 4] = data.as_slice().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    /// Returns the DHCP message type (Option 53) if present.
    ///
    /// Returns `None` for BOOTP packets which don't have this option.
    pub fn message_type(&self) -> Option<V4MessageType> {
        let data = &self.option(V4OptionCode::MessageType)?.data;
        V4MessageType::try_from(*data.first()?).ok()
    }

    /// Returns the requested IP address (Option 50) if present.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.ipv4_option(V4OptionCode::RequestedIpAddress)
    }

    /// Returns the server identifier (Option 54) if present.
    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.ipv4_option(V4OptionCode::ServerIdentifier)
    }

    /// Returns the client identifier (Option 61) if present and non-empty.
    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.option(V4OptionCode::ClientIdentifier)
            .map(|option| option.data.as_slice())
            .filter(|data| !data.is_empty())
    }

    /// Returns the client hostname (Option 12) if present.
    pub fn hostname(&self) -> Option<&str> {
        self.option(V4OptionCode::Hostname)
            .and_then(|option| option.as_str())
    }

    /// Returns the FQDN (Option 81), falling back to the hostname.
    pub fn fqdn(&self) -> Option<String> {
        self.option(V4OptionCode::ClientFqdn)
            .and_then(|option| fqdn_from_option(option, true))
            .or_else(|| self.hostname().map(str::to_string))
    }

    /// Returns the requested lease time (Option 51) if present.
    pub fn requested_lease_time(&self) -> Option<u32> {
        self.option(V4OptionCode::LeaseTime)
            .and_then(DhcpOption::as_u32)
    }

    /// Returns the parameter request list (Option 55) if present.
    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.option(V4OptionCode::ParameterRequestList)
            .map(|option| option.data.as_slice())
    }

    pub fn rapid_commit(&self) -> bool {
        self.option(V4OptionCode::RapidCommit).is_some()
    }

    /// Returns the client hardware address bytes (respecting hlen).
    pub fn chaddr_bytes(&self) -> &[u8] {
        let len = (self.hlen as usize).min(self.chaddr.len());
        &self.chaddr[..len]
    }

    /// Formats the client hardware address as a colon-separated string.
    pub fn format_mac(&self) -> String {
        ClientId::new(self.chaddr_bytes()).to_string()
    }

    /// Returns a unique client identifier for lease tracking.
    ///
    /// Uses Option 61 (Client Identifier) if present, otherwise
    /// constructs an identifier from hardware type + hardware address.
    pub fn client_id(&self) -> ClientId {
        match self.client_identifier() {
            Some(id) => ClientId::new(id),
            None => ClientId::from_hardware(self.htype, self.chaddr_bytes()),
        }
    }

    /// Returns true if the broadcast flag (bit 15) is set.
    pub fn is_broadcast(&self) -> bool {
        (self.flags & 0x8000) != 0
    }

    /// Creates a reply from a request.
    ///
    /// The message type is added as the first option. `xid`, `flags`,
    /// `giaddr`, `chaddr`, `htype` and `hlen` are copied from the request.
    pub fn create_reply(
        request: &DhcpV4Message,
        message_type: V4MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut all_options = vec![DhcpOption::new(
            V4OptionCode::MessageType.into(),
            vec![message_type as u8],
        )];
        all_options.extend(options);

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            xid: request.xid,
            flags: request.flags,
            ciaddr: if message_type == V4MessageType::Nak {
                Ipv4Addr::UNSPECIFIED
            } else {
                request.ciaddr
            },
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            options: all_options,
        }
    }
}

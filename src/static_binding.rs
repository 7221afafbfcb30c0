//! Fixed client-to-address reservations.

use std::fmt;
use std::net::IpAddr;

use crate::message::ClientId;
use crate::policy::PolicyLevel;
use crate::store::{IaKey, IaType};

/// How a static binding recognises its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMatch {
    /// DHCPv6 DUID, optionally narrowed to one IA.
    Duid {
        duid: ClientId,
        ia_type: Option<IaType>,
        iaid: Option<u32>,
    },
    /// DHCPv4 hardware address.
    Mac([u8; 6]),
    /// DHCPv4 client identifier (option 61).
    ClientId(ClientId),
}

/// A reserved address or prefix for one client.
#[derive(Debug)]
pub struct StaticBinding {
    client: ClientMatch,
    address: IpAddr,
    prefix_length: Option<u8>,
    level: PolicyLevel,
}

impl StaticBinding {
    pub fn new(
        client: ClientMatch,
        address: IpAddr,
        prefix_length: Option<u8>,
        level: PolicyLevel,
    ) -> Self {
        Self {
            client,
            address,
            prefix_length,
            level,
        }
    }

    pub fn client(&self) -> &ClientMatch {
        &self.client
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix_length(&self) -> Option<u8> {
        self.prefix_length
    }

    pub fn policy_level(&self) -> &PolicyLevel {
        &self.level
    }

    /// IA type this binding serves.
    fn serves(&self, ia_type: IaType) -> bool {
        match (&self.client, ia_type) {
            (ClientMatch::Mac(_) | ClientMatch::ClientId(_), IaType::V4) => true,
            (ClientMatch::Duid { ia_type: Some(wanted), .. }, actual) => *wanted == actual,
            (ClientMatch::Duid { .. }, IaType::Pd) => self.prefix_length.is_some(),
            (ClientMatch::Duid { .. }, IaType::Na) => self.prefix_length.is_none(),
            _ => false,
        }
    }

    /// Returns true if the binding belongs to the IA `key`.
    ///
    /// `hardware` is the DHCPv4 chaddr, used for MAC matches.
    pub fn matches(&self, key: &IaKey, hardware: Option<&[u8]>) -> bool {
        if !self.serves(key.ia_type) {
            return false;
        }
        match &self.client {
            ClientMatch::Duid { duid, iaid, .. } => {
                key.client_id == *duid && iaid.is_none_or(|iaid| iaid == key.iaid)
            }
            ClientMatch::Mac(mac) => {
                hardware.is_some_and(|hw| hw.get(..6) == Some(mac.as_slice()))
                    || key.client_id == ClientId::from_hardware(1, mac)
            }
            ClientMatch::ClientId(id) => key.client_id == *id,
        }
    }
}

impl fmt::Display for StaticBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let client = match &self.client {
            ClientMatch::Duid { duid, .. } => duid.to_string(),
            ClientMatch::ClientId(id) => id.to_string(),
            ClientMatch::Mac(mac) => mac
                .iter()
                .map(|byte| format!("{:02x}", byte))
                .collect::<Vec<_>>()
                .join(":"),
        };
        match self.prefix_length {
            Some(length) => write!(f, "{} -> {}/{}", client, self.address, length),
            None => write!(f, "{} -> {}", client, self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

    fn duid() -> ClientId {
        ClientId::new(vec![0, 3, 0, 1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
    }

    #[test]
    fn test_mac_match_by_chaddr_or_client_id() {
        let binding = StaticBinding::new(
            ClientMatch::Mac(MAC),
            "192.168.1.50".parse().unwrap(),
            None,
            PolicyLevel::default(),
        );
        let other = IaKey::v4(ClientId::new(b"custom-id".to_vec()));
        assert!(binding.matches(&other, Some(&MAC)));

        let hardware_key = IaKey::v4(ClientId::from_hardware(1, &MAC));
        assert!(binding.matches(&hardware_key, None));

        assert!(!binding.matches(&other, Some(&[0x11; 6])));
    }

    #[test]
    fn test_duid_match_respects_iaid() {
        let binding = StaticBinding::new(
            ClientMatch::Duid {
                duid: duid(),
                ia_type: None,
                iaid: Some(1),
            },
            "2001:db8::50".parse().unwrap(),
            None,
            PolicyLevel::default(),
        );
        assert!(binding.matches(&IaKey::new(duid(), IaType::Na, 1), None));
        assert!(!binding.matches(&IaKey::new(duid(), IaType::Na, 2), None));
        assert!(!binding.matches(&IaKey::new(duid(), IaType::Pd, 1), None));
        assert!(!binding.matches(&IaKey::new(duid(), IaType::Ta, 1), None));
    }

    #[test]
    fn test_prefix_binding_serves_pd() {
        let binding = StaticBinding::new(
            ClientMatch::Duid {
                duid: duid(),
                ia_type: None,
                iaid: None,
            },
            "2001:db8:100::".parse().unwrap(),
            Some(56),
            PolicyLevel::default(),
        );
        assert!(binding.matches(&IaKey::new(duid(), IaType::Pd, 9), None));
        assert!(!binding.matches(&IaKey::new(duid(), IaType::Na, 9), None));
        assert_eq!(binding.to_string(), format!("{} -> 2001:db8:100::/56", duid()));
    }
}

//! Runtime bindings: persisted IA records joined with the configuration
//! objects (pool or static reservation) that produced each address.
//!
//! Bindings are rebuilt from the store on every request and are never the
//! source of truth themselves.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::link::Link;
use crate::options::DhcpOption;
use crate::policy::PolicyLevel;
use crate::pool::BindingPool;
use crate::static_binding::StaticBinding;
use crate::store::{IaAddressRecord, IaKey, IdentityAssoc, LeaseState};

/// The configuration object an address came from.
#[derive(Debug, Clone)]
pub enum BindingOwner {
    Pool(Arc<BindingPool>),
    Static(Arc<StaticBinding>),
}

impl BindingOwner {
    /// Returns `ip` to its pool. Static reservations hold nothing to free.
    pub fn free(&self, ip: IpAddr) -> bool {
        match self {
            Self::Pool(pool) => pool.free(ip),
            Self::Static(_) => false,
        }
    }

    pub fn policy_level(&self) -> &PolicyLevel {
        match self {
            Self::Pool(pool) => pool.policy_level(),
            Self::Static(binding) => binding.policy_level(),
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, Self::Static(_))
    }
}

/// Operations shared by every object held in a binding.
pub trait BindingObjectOps {
    fn record(&self) -> &IaAddressRecord;

    fn record_mut(&mut self) -> &mut IaAddressRecord;

    fn owner(&self) -> &BindingOwner;

    fn ip(&self) -> IpAddr {
        self.record().ip
    }

    fn state(&self) -> LeaseState {
        self.record().state
    }

    /// Sets the state and lease times. `None` lifetimes mean infinite.
    fn set_lease(
        &mut self,
        state: LeaseState,
        now: DateTime<Utc>,
        preferred: Option<u32>,
        valid: Option<u32>,
    ) {
        let record = self.record_mut();
        record.state = state;
        record.start_time = Some(now);
        record.preferred_end_time = preferred.map(|secs| now + TimeDelta::seconds(i64::from(secs)));
        record.valid_end_time = valid.map(|secs| now + TimeDelta::seconds(i64::from(secs)));
    }
}

/// A leased address (IA_NA, IA_TA or DHCPv4).
#[derive(Debug, Clone)]
pub struct BindingAddress {
    pub record: IaAddressRecord,
    pub owner: BindingOwner,
}

/// A delegated prefix.
#[derive(Debug, Clone)]
pub struct BindingPrefix {
    pub record: IaAddressRecord,
    pub owner: BindingOwner,
}

impl BindingPrefix {
    pub fn prefix_length(&self) -> u8 {
        self.record.prefix_length.unwrap_or(128)
    }
}

impl BindingObjectOps for BindingAddress {
    fn record(&self) -> &IaAddressRecord {
        &self.record
    }

    fn record_mut(&mut self) -> &mut IaAddressRecord {
        &mut self.record
    }

    fn owner(&self) -> &BindingOwner {
        &self.owner
    }
}

impl BindingObjectOps for BindingPrefix {
    fn record(&self) -> &IaAddressRecord {
        &self.record
    }

    fn record_mut(&mut self) -> &mut IaAddressRecord {
        &mut self.record
    }

    fn owner(&self) -> &BindingOwner {
        &self.owner
    }
}

#[derive(Debug, Clone)]
pub enum BindingObject {
    Address(BindingAddress),
    Prefix(BindingPrefix),
}

impl BindingObject {
    /// Wraps a record, choosing the variant from its prefix length.
    pub fn new(record: IaAddressRecord, owner: BindingOwner) -> Self {
        if record.prefix_length.is_some() {
            Self::Prefix(BindingPrefix { record, owner })
        } else {
            Self::Address(BindingAddress { record, owner })
        }
    }
}

impl BindingObjectOps for BindingObject {
    fn record(&self) -> &IaAddressRecord {
        match self {
            Self::Address(address) => address.record(),
            Self::Prefix(prefix) => prefix.record(),
        }
    }

    fn record_mut(&mut self) -> &mut IaAddressRecord {
        match self {
            Self::Address(address) => address.record_mut(),
            Self::Prefix(prefix) => prefix.record_mut(),
        }
    }

    fn owner(&self) -> &BindingOwner {
        match self {
            Self::Address(address) => address.owner(),
            Self::Prefix(prefix) => prefix.owner(),
        }
    }
}

/// A client's IA on one link with its live objects.
#[derive(Debug, Clone)]
pub struct Binding {
    pub key: IaKey,
    pub link: Arc<Link>,
    pub state: LeaseState,
    pub objects: Vec<BindingObject>,
    /// Records found in the store that no longer belong to the link.
    pub stale: Vec<IaAddressRecord>,
    pub hostname: Option<String>,
    pub options: Vec<DhcpOption>,
    pub created_at: DateTime<Utc>,
}

impl Binding {
    pub fn new(key: IaKey, link: Arc<Link>, state: LeaseState) -> Self {
        Self {
            key,
            link,
            state,
            objects: Vec::new(),
            stale: Vec::new(),
            hostname: None,
            options: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn ips(&self) -> Vec<IpAddr> {
        self.objects.iter().map(BindingObjectOps::ip).collect()
    }

    pub fn has_address(&self, ip: IpAddr) -> bool {
        self.objects.iter().any(|object| object.ip() == ip)
    }

    pub fn object(&self, ip: IpAddr) -> Option<&BindingObject> {
        self.objects.iter().find(|object| object.ip() == ip)
    }

    /// The persisted form of the binding's live objects.
    pub fn to_ia(&self) -> IdentityAssoc {
        IdentityAssoc {
            key: self.key.clone(),
            state: self.state,
            hostname: self.hostname.clone(),
            created_at: self.created_at,
            addresses: self
                .objects
                .iter()
                .map(|object| object.record().clone())
                .collect(),
            options: self.options.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ClientId;
    use crate::pool::PoolKind;
    use crate::range::AddressRange;
    use crate::static_binding::ClientMatch;

    fn pool() -> Arc<BindingPool> {
        Arc::new(
            BindingPool::new(
                "pool",
                PoolKind::V4Address,
                AddressRange::parse("10.0.0.10-10.0.0.12").unwrap(),
                PolicyLevel::default(),
                None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_owner_free_dispatch() {
        let pool = pool();
        let ip: IpAddr = "10.0.0.10".parse().unwrap();
        assert!(pool.claim(ip));

        let owner = BindingOwner::Pool(Arc::clone(&pool));
        assert!(owner.free(ip));
        assert!(pool.is_free(ip));

        let reserved = BindingOwner::Static(Arc::new(StaticBinding::new(
            ClientMatch::ClientId(ClientId::new(vec![1, 2, 3])),
            ip,
            None,
            PolicyLevel::default(),
        )));
        assert!(!reserved.free(ip));
        assert!(reserved.is_static());
    }

    #[test]
    fn test_object_variant_and_lease_times() {
        let record = IaAddressRecord::new(
            "2001:db8:1::".parse().unwrap(),
            Some(56),
            LeaseState::Advertised,
        );
        let mut object = BindingObject::new(record, BindingOwner::Pool(pool()));
        assert!(matches!(
            object,
            BindingObject::Prefix(ref prefix) if prefix.prefix_length() == 56
        ));

        let now = Utc::now();
        object.set_lease(LeaseState::Committed, now, Some(100), Some(200));
        assert_eq!(object.state(), LeaseState::Committed);
        assert_eq!(object.record().valid_lifetime(now), 200);
        assert_eq!(object.record().preferred_lifetime(now), 100);

        object.set_lease(LeaseState::Static, now, None, None);
        assert_eq!(object.record().valid_lifetime(now), u32::MAX);
    }
}

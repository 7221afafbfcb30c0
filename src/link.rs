//! Links (subnets) and the map used to find the link for an address.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use crate::binding::BindingOwner;
use crate::policy::PolicyLevel;
use crate::pool::BindingPool;
use crate::static_binding::StaticBinding;
use crate::store::{IaKey, IaType};

/// A network segment with its pools and reservations.
#[derive(Debug)]
pub struct Link {
    name: String,
    subnet: IpNet,
    level: PolicyLevel,
    v4_pools: Vec<Arc<BindingPool>>,
    na_pools: Vec<Arc<BindingPool>>,
    ta_pools: Vec<Arc<BindingPool>>,
    pd_pools: Vec<Arc<BindingPool>>,
    v4_statics: Vec<Arc<StaticBinding>>,
    v6_statics: Vec<Arc<StaticBinding>>,
}

impl Link {
    pub fn new(name: impl Into<String>, subnet: IpNet, level: PolicyLevel) -> Self {
        Self {
            name: name.into(),
            subnet,
            level,
            v4_pools: Vec::new(),
            na_pools: Vec::new(),
            ta_pools: Vec::new(),
            pd_pools: Vec::new(),
            v4_statics: Vec::new(),
            v6_statics: Vec::new(),
        }
    }

    /// Adds a pool serving `ia_type`. Pools are kept in declaration order.
    pub fn add_pool(&mut self, ia_type: IaType, pool: BindingPool) {
        let pool = Arc::new(pool);
        match ia_type {
            IaType::V4 => self.v4_pools.push(pool),
            IaType::Na => self.na_pools.push(pool),
            IaType::Ta => self.ta_pools.push(pool),
            IaType::Pd => self.pd_pools.push(pool),
        }
    }

    pub fn add_static(&mut self, binding: StaticBinding) {
        if binding.address().is_ipv4() {
            self.v4_statics.push(Arc::new(binding));
        } else {
            self.v6_statics.push(Arc::new(binding));
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subnet(&self) -> IpNet {
        self.subnet
    }

    pub fn policy_level(&self) -> &PolicyLevel {
        &self.level
    }

    pub fn pools(&self, ia_type: IaType) -> &[Arc<BindingPool>] {
        match ia_type {
            IaType::V4 => &self.v4_pools,
            IaType::Na => &self.na_pools,
            IaType::Ta => &self.ta_pools,
            IaType::Pd => &self.pd_pools,
        }
    }

    pub fn statics(&self, ia_type: IaType) -> &[Arc<StaticBinding>] {
        if ia_type == IaType::V4 {
            &self.v4_statics
        } else {
            &self.v6_statics
        }
    }

    /// Returns true if `ip` belongs on this link.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.subnet.contains(&ip)
            || IaType::ALL
                .iter()
                .any(|ia_type| self.pools(*ia_type).iter().any(|pool| pool.range().contains(ip)))
    }

    pub fn find_pool(&self, ia_type: IaType, ip: IpAddr) -> Option<&Arc<BindingPool>> {
        self.pools(ia_type).iter().find(|pool| pool.contains(ip))
    }

    /// The reservation for this IA, if any.
    pub fn find_static(&self, key: &IaKey, hardware: Option<&[u8]>) -> Option<&Arc<StaticBinding>> {
        self.statics(key.ia_type)
            .iter()
            .find(|binding| binding.matches(key, hardware))
    }

    /// Resolves which configuration object owns `ip` for the IA `key`.
    ///
    /// A reservation wins over a pool. `None` means the address is not
    /// valid for this client on this link.
    pub fn owner_of(
        &self,
        key: &IaKey,
        ip: IpAddr,
        hardware: Option<&[u8]>,
    ) -> Option<BindingOwner> {
        let reserved = self
            .statics(key.ia_type)
            .iter()
            .find(|binding| binding.address() == ip);
        match reserved {
            Some(binding) if binding.matches(key, hardware) => {
                Some(BindingOwner::Static(Arc::clone(binding)))
            }
            Some(_) => None,
            None => self
                .find_pool(key.ia_type, ip)
                .map(|pool| BindingOwner::Pool(Arc::clone(pool))),
        }
    }
}

/// All configured links.
#[derive(Debug, Default)]
pub struct LinkMap {
    links: Vec<Arc<Link>>,
}

impl LinkMap {
    pub fn new(links: Vec<Link>) -> Self {
        Self {
            links: links.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn links(&self) -> &[Arc<Link>] {
        &self.links
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Finds the link whose subnet contains `ip`, preferring the longest
    /// prefix.
    pub fn find_by_address(&self, ip: IpAddr) -> Option<Arc<Link>> {
        self.links
            .iter()
            .filter(|link| link.subnet().contains(&ip))
            .max_by_key(|link| link.subnet().prefix_len())
            .or_else(|| self.links.iter().find(|link| link.contains(ip)))
            .cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Link>> {
        self.links.iter().find(|link| link.name() == name).cloned()
    }

    /// The first link of the given family, used for directly connected
    /// clients when no better locator is available.
    pub fn default_link(&self, v4: bool) -> Option<Arc<Link>> {
        self.links
            .iter()
            .find(|link| matches!(link.subnet(), IpNet::V4(_)) == v4)
            .cloned()
    }

    /// Finds the pool holding `ip` on any link.
    pub fn find_pool(&self, ia_type: IaType, ip: IpAddr) -> Option<Arc<BindingPool>> {
        self.links
            .iter()
            .find_map(|link| link.find_pool(ia_type, ip).cloned())
    }
}

//! Dynamic address and prefix pools.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use tracing::warn;

use crate::error::Result;
use crate::free_pool::FreePool;
use crate::options::DhcpOption;
use crate::policy::{FilterConfig, PolicyLevel};
use crate::range::AddressRange;

/// Checks whether an address already answers on the network.
pub trait ReachabilityProbe: Send + Sync {
    fn is_reachable(&self, ip: Ipv4Addr) -> bool;
}

/// What a pool hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    V4Address,
    /// IA_NA or IA_TA addresses.
    V6Address,
    /// Delegated prefixes of a fixed length.
    V6Prefix { prefix_length: u8 },
}

/// A configured range plus its allocation state.
#[derive(Debug)]
pub struct BindingPool {
    name: String,
    kind: PoolKind,
    level: PolicyLevel,
    filter: Option<FilterConfig>,
    free_pool: FreePool,
}

impl BindingPool {
    /// Builds a pool over `range`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidRange`] when the range family does not
    /// match `kind` or a prefix pool range is not aligned.
    pub fn new(
        name: impl Into<String>,
        kind: PoolKind,
        range: AddressRange,
        level: PolicyLevel,
        filter: Option<FilterConfig>,
    ) -> Result<Self> {
        let name = name.into();
        let wants_v4 = kind == PoolKind::V4Address;
        if range.is_ipv4() != wants_v4 {
            return Err(crate::Error::InvalidRange(format!(
                "{name}: {range} is the wrong address family"
            )));
        }
        let free_pool = match kind {
            PoolKind::V6Prefix { prefix_length } => FreePool::for_prefixes(range, prefix_length)?,
            _ => FreePool::new(range),
        };
        let mut level = level;
        if let Some(filter) = &filter {
            level.filters.insert(0, filter.clone());
        }
        Ok(Self {
            name,
            kind,
            level,
            filter,
            free_pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn range(&self) -> &AddressRange {
        self.free_pool.range()
    }

    pub fn prefix_length(&self) -> Option<u8> {
        match self.kind {
            PoolKind::V6Prefix { prefix_length } => Some(prefix_length),
            _ => None,
        }
    }

    /// Policies and options of this pool, including its filter.
    pub fn policy_level(&self) -> &PolicyLevel {
        &self.level
    }

    pub fn options(&self) -> &[DhcpOption] {
        &self.level.options
    }

    pub fn is_filtered(&self) -> bool {
        self.filter.is_some()
    }

    /// Returns true if a request with these options may use the pool.
    pub fn accepts(&self, request: &[DhcpOption]) -> bool {
        self.filter
            .as_ref()
            .is_none_or(|filter| filter.matches(request))
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.free_pool.contains(ip)
    }

    pub fn is_free(&self, ip: IpAddr) -> bool {
        self.free_pool.contains(ip) && !self.free_pool.is_used(ip)
    }

    /// Marks an address used. Returns true if this call claimed it.
    pub fn claim(&self, ip: IpAddr) -> bool {
        self.free_pool.mark_used(ip)
    }

    /// Returns an address to the pool. Returns true if it was in use.
    pub fn free(&self, ip: IpAddr) -> bool {
        self.free_pool.mark_free(ip)
    }

    /// Claims the next free address.
    ///
    /// With a probe, an IPv4 candidate that answers stays marked used (it is
    /// in use by someone) and one further candidate is tried.
    pub fn next_available(&self, probe: Option<&dyn ReachabilityProbe>) -> Option<IpAddr> {
        let mut candidate = self.free_pool.allocate_next()?;
        let Some(probe) = probe else {
            return Some(candidate);
        };

        for attempt in 0..2 {
            let IpAddr::V4(v4) = candidate else {
                return Some(candidate);
            };
            if !probe.is_reachable(v4) {
                return Some(candidate);
            }
            warn!("{} answered a probe; leaving it marked used in {}", v4, self.name);
            if attempt == 0 {
                candidate = self.free_pool.allocate_next()?;
            }
        }
        None
    }

    pub fn size(&self) -> u128 {
        self.free_pool.size()
    }

    pub fn used_count(&self) -> u128 {
        self.free_pool.used_count()
    }

    pub fn free_count(&self) -> u128 {
        self.free_pool.free_count()
    }
}

impl fmt::Display for BindingPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PoolKind::V6Prefix { prefix_length } => {
                write!(f, "{} {} /{}", self.name, self.range(), prefix_length)
            }
            _ => write!(f, "{} {}", self.name, self.range()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{FilterExpression, FilterOperator};
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct ProbeSet(Mutex<HashSet<Ipv4Addr>>);

    impl ReachabilityProbe for ProbeSet {
        fn is_reachable(&self, ip: Ipv4Addr) -> bool {
            self.0.lock().unwrap().contains(&ip)
        }
    }

    fn v4_pool(range: &str) -> BindingPool {
        BindingPool::new(
            "test",
            PoolKind::V4Address,
            AddressRange::parse(range).unwrap(),
            PolicyLevel::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_wrong_family_rejected() {
        let result = BindingPool::new(
            "bad",
            PoolKind::V6Address,
            AddressRange::parse("10.0.0.0/24").unwrap(),
            PolicyLevel::default(),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_probe_skips_one_responding_address() {
        let pool = v4_pool("10.0.0.10-10.0.0.12");
        let probe = ProbeSet(Mutex::new(HashSet::from([Ipv4Addr::new(10, 0, 0, 10)])));

        let ip = pool.next_available(Some(&probe));
        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 11))));
        assert!(!pool.is_free("10.0.0.10".parse().unwrap()));
        assert_eq!(pool.used_count(), 2);
    }

    #[test]
    fn test_probe_gives_up_after_one_retry() {
        let pool = v4_pool("10.0.0.10-10.0.0.12");
        let probe = ProbeSet(Mutex::new(HashSet::from([
            Ipv4Addr::new(10, 0, 0, 10),
            Ipv4Addr::new(10, 0, 0, 11),
        ])));

        assert_eq!(pool.next_available(Some(&probe)), None);
        assert_eq!(pool.used_count(), 2);
        assert_eq!(
            pool.next_available(None),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 12)))
        );
    }

    #[test]
    fn test_prefix_pool_hands_out_aligned_prefixes() {
        let pool = BindingPool::new(
            "pd",
            PoolKind::V6Prefix { prefix_length: 64 },
            AddressRange::parse("2001:db8::/56").unwrap(),
            PolicyLevel::default(),
            None,
        )
        .unwrap();
        assert_eq!(pool.size(), 256);
        assert_eq!(
            pool.next_available(None),
            Some("2001:db8::".parse().unwrap())
        );
        assert_eq!(
            pool.next_available(None),
            Some("2001:db8:0:1::".parse().unwrap())
        );
        assert_eq!(pool.prefix_length(), Some(64));
    }

    #[test]
    fn test_filter_gates_pool() {
        let filter = FilterConfig {
            name: "printers".to_string(),
            expressions: vec![FilterExpression {
                option: 60,
                operator: FilterOperator::Equals,
                value: "printer".to_string(),
            }],
            policies: vec![],
            options: vec![],
        };
        let pool = BindingPool::new(
            "printers",
            PoolKind::V4Address,
            AddressRange::parse("10.0.1.0/28").unwrap(),
            PolicyLevel::default(),
            Some(filter),
        )
        .unwrap();
        assert!(pool.is_filtered());
        assert!(pool.accepts(&[DhcpOption::new(60, b"printer".to_vec())]));
        assert!(!pool.accepts(&[DhcpOption::new(60, b"laptop".to_vec())]));
        assert!(!pool.accepts(&[]));
    }
}

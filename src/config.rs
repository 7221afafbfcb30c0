use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::link::{Link, LinkMap};
use crate::message::ClientId;
use crate::options::DhcpOption;
use crate::policy::{FilterConfig, Policy, PolicyEntry, PolicyLevel, PolicyValue};
use crate::pool::{BindingPool, PoolKind};
use crate::range::AddressRange;
use crate::static_binding::{ClientMatch, StaticBinding};
use crate::store::IaType;

fn default_true() -> bool {
    true
}

fn default_store_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address sent as the DHCPv4 server identifier.
    pub server_ipv4: Ipv4Addr,
    /// DHCPv6 server DUID, colon-separated hex.
    pub server_duid: String,
    /// Advertised in the Server Unicast option where `server_unicast` is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ipv6: Option<Ipv6Addr>,
    pub leases_file: String,
    #[serde(default = "default_true")]
    pub delete_old_bindings: bool,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub policies: Vec<PolicyEntry>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    #[serde(default)]
    pub options: Vec<DhcpOption>,
    pub links: Vec<LinkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    pub start_delay_secs: u64,
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            start_delay_secs: 10,
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub name: String,
    pub subnet: IpNet,
    #[serde(default)]
    pub policies: Vec<PolicyEntry>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    #[serde(default)]
    pub options: Vec<DhcpOption>,
    #[serde(default)]
    pub v4_pools: Vec<PoolConfig>,
    #[serde(default)]
    pub na_pools: Vec<PoolConfig>,
    #[serde(default)]
    pub ta_pools: Vec<PoolConfig>,
    #[serde(default)]
    pub pd_pools: Vec<PoolConfig>,
    #[serde(default)]
    pub v4_static_bindings: Vec<V4StaticBindingConfig>,
    #[serde(default)]
    pub v6_static_bindings: Vec<V6StaticBindingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// `"start-end"` or CIDR.
    pub range: AddressRange,
    /// Delegated prefix length; prefix pools only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_length: Option<u8>,
    #[serde(default)]
    pub policies: Vec<PolicyEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterConfig>,
    #[serde(default)]
    pub options: Vec<DhcpOption>,
}

/// DHCPv4 reservation matched by MAC address or client identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V4StaticBindingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub ip_address: Ipv4Addr,
    #[serde(default)]
    pub policies: Vec<PolicyEntry>,
    #[serde(default)]
    pub options: Vec<DhcpOption>,
}

/// DHCPv6 reservation matched by DUID, optionally narrowed to one IA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V6StaticBindingConfig {
    pub duid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ia_type: Option<IaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iaid: Option<u32>,
    pub address: Ipv6Addr,
    /// Set for a reserved delegated prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_length: Option<u8>,
    #[serde(default)]
    pub policies: Vec<PolicyEntry>,
    #[serde(default)]
    pub options: Vec<DhcpOption>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ipv4: Ipv4Addr::new(192, 168, 1, 1),
            server_duid: "00:01:00:01:2c:5a:6b:7c:00:11:22:33:44:55".to_string(),
            server_ipv6: None,
            leases_file: "leases.json".to_string(),
            delete_old_bindings: true,
            store_timeout_ms: default_store_timeout_ms(),
            reaper: ReaperConfig::default(),
            policies: vec![PolicyEntry::new(
                Policy::V4LeaseTime,
                PolicyValue::Number(86400),
            )],
            filters: Vec::new(),
            options: Vec::new(),
            links: vec![LinkConfig {
                name: "lan".to_string(),
                subnet: IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::new(192, 168, 1, 0), 24)),
                policies: Vec::new(),
                filters: Vec::new(),
                options: vec![
                    DhcpOption::new(1, [255, 255, 255, 0]),
                    DhcpOption::new(3, [192, 168, 1, 1]),
                    DhcpOption::new(6, [8, 8, 8, 8, 8, 8, 4, 4]),
                ],
                v4_pools: vec![PoolConfig {
                    range: AddressRange::v4(
                        Ipv4Addr::new(192, 168, 1, 100),
                        Ipv4Addr::new(192, 168, 1, 200),
                    ),
                    prefix_length: None,
                    policies: Vec::new(),
                    filter: None,
                    options: Vec::new(),
                }],
                na_pools: Vec::new(),
                ta_pools: Vec::new(),
                pd_pools: Vec::new(),
                v4_static_bindings: Vec::new(),
                v6_static_bindings: Vec::new(),
            }],
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.links.is_empty() {
            return Err(Error::InvalidConfig("at least one link is required".to_string()));
        }
        self.server_id()?;

        if self.store_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "store_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.reaper.interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "reaper.interval_secs must be greater than 0".to_string(),
            ));
        }

        validate_policies("global", &self.policies)?;
        validate_filters("global", &self.filters)?;

        let mut ranges: Vec<(String, AddressRange)> = Vec::new();
        for link in &self.links {
            validate_policies(&link.name, &link.policies)?;
            validate_filters(&link.name, &link.filters)?;
            for (ia_type, pool) in link.pool_configs() {
                validate_pool(link, ia_type, pool)?;
                for (other, range) in &ranges {
                    if range.overlaps(&pool.range) {
                        return Err(Error::InvalidConfig(format!(
                            "pool {} on {} overlaps pool {} on {}",
                            pool.range, link.name, range, other
                        )));
                    }
                }
                ranges.push((link.name.clone(), pool.range));
            }
            for binding in &link.v4_static_bindings {
                validate_policies(&link.name, &binding.policies)?;
                v4_static_match(binding)?;
                if !link.subnet.contains(&IpAddr::V4(binding.ip_address)) {
                    return Err(Error::InvalidConfig(format!(
                        "static binding {} is outside {} ({})",
                        binding.ip_address, link.name, link.subnet
                    )));
                }
            }
            for binding in &link.v6_static_bindings {
                validate_policies(&link.name, &binding.policies)?;
                parse_identifier(&binding.duid)?;
                if binding.prefix_length.is_none()
                    && !link.subnet.contains(&IpAddr::V6(binding.address))
                {
                    return Err(Error::InvalidConfig(format!(
                        "static binding {} is outside {} ({})",
                        binding.address, link.name, link.subnet
                    )));
                }
                if let Some(length) = binding.prefix_length
                    && (length == 0 || length > 128)
                {
                    return Err(Error::InvalidConfig(format!(
                        "static binding {}: invalid prefix length /{}",
                        binding.address, length
                    )));
                }
            }
        }

        self.build_links().map(|_| ())
    }

    /// DHCPv6 server identifier.
    pub fn server_id(&self) -> Result<ClientId> {
        parse_identifier(&self.server_duid)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn global_level(&self) -> PolicyLevel {
        PolicyLevel::new(
            self.policies.clone(),
            self.filters.clone(),
            self.options.clone(),
        )
    }

    /// Builds the runtime links with their pools and reservations.
    pub fn build_links(&self) -> Result<LinkMap> {
        let mut links = Vec::with_capacity(self.links.len());
        for config in &self.links {
            let mut link = Link::new(
                config.name.clone(),
                config.subnet,
                PolicyLevel::new(
                    config.policies.clone(),
                    config.filters.clone(),
                    config.options.clone(),
                ),
            );

            for (index, (ia_type, pool)) in config.pool_configs().enumerate() {
                let kind = match ia_type {
                    IaType::V4 => PoolKind::V4Address,
                    IaType::Na | IaType::Ta => PoolKind::V6Address,
                    IaType::Pd => PoolKind::V6Prefix {
                        prefix_length: pool.prefix_length.unwrap_or(64),
                    },
                };
                let level =
                    PolicyLevel::new(pool.policies.clone(), Vec::new(), pool.options.clone());
                let built = BindingPool::new(
                    format!("{}-{}-{}", config.name, ia_type, index),
                    kind,
                    pool.range,
                    level,
                    pool.filter.clone(),
                )
                .map_err(|e| Error::InvalidConfig(format!("link {}: {}", config.name, e)))?;
                link.add_pool(ia_type, built);
            }

            for binding in &config.v4_static_bindings {
                let level = PolicyLevel::new(
                    binding.policies.clone(),
                    Vec::new(),
                    binding.options.clone(),
                );
                link.add_static(StaticBinding::new(
                    v4_static_match(binding)?,
                    IpAddr::V4(binding.ip_address),
                    None,
                    level,
                ));
            }
            for binding in &config.v6_static_bindings {
                let level = PolicyLevel::new(
                    binding.policies.clone(),
                    Vec::new(),
                    binding.options.clone(),
                );
                link.add_static(StaticBinding::new(
                    ClientMatch::Duid {
                        duid: parse_identifier(&binding.duid)?,
                        ia_type: binding.ia_type,
                        iaid: binding.iaid,
                    },
                    IpAddr::V6(binding.address),
                    binding.prefix_length,
                    level,
                ));
            }
            links.push(link);
        }
        Ok(LinkMap::new(links))
    }

    /// Every configured pool range plus every reserved address; store
    /// records outside these are dropped at startup.
    pub fn managed_ranges(&self) -> Vec<AddressRange> {
        let mut ranges = Vec::new();
        for link in &self.links {
            ranges.extend(link.pool_configs().map(|(_, pool)| pool.range));
            for binding in &link.v4_static_bindings {
                let ip = IpAddr::V4(binding.ip_address);
                ranges.extend(AddressRange::new(ip, ip));
            }
            for binding in &link.v6_static_bindings {
                let ip = IpAddr::V6(binding.address);
                ranges.extend(AddressRange::new(ip, ip));
            }
        }
        ranges
    }
}

impl LinkConfig {
    /// All pools of the link with the IA type they serve, in declaration
    /// order.
    pub fn pool_configs(&self) -> impl Iterator<Item = (IaType, &PoolConfig)> {
        let v4 = self.v4_pools.iter().map(|pool| (IaType::V4, pool));
        let na = self.na_pools.iter().map(|pool| (IaType::Na, pool));
        let ta = self.ta_pools.iter().map(|pool| (IaType::Ta, pool));
        let pd = self.pd_pools.iter().map(|pool| (IaType::Pd, pool));
        v4.chain(na).chain(ta).chain(pd)
    }
}

fn parse_identifier(text: &str) -> Result<ClientId> {
    text.parse::<ClientId>()
        .map_err(|e| Error::InvalidConfig(format!("invalid identifier '{}': {}", text, e)))
}

fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let id = parse_identifier(text)?;
    id.as_bytes()
        .try_into()
        .map_err(|_| Error::InvalidConfig(format!("invalid MAC address '{}'", text)))
}

fn v4_static_match(binding: &V4StaticBindingConfig) -> Result<ClientMatch> {
    match (&binding.mac_address, &binding.client_id) {
        (Some(mac), None) => Ok(ClientMatch::Mac(parse_mac(mac)?)),
        (None, Some(id)) => Ok(ClientMatch::ClientId(parse_identifier(id)?)),
        _ => Err(Error::InvalidConfig(format!(
            "static binding {} needs exactly one of mac_address or client_id",
            binding.ip_address
        ))),
    }
}

fn validate_policies(scope: &str, policies: &[PolicyEntry]) -> Result<()> {
    for entry in policies {
        if !entry.value.matches_kind_of(entry.name) {
            return Err(Error::InvalidConfig(format!(
                "{}: policy {} has a value of the wrong kind",
                scope, entry.name
            )));
        }
        if entry.name.is_lifetime() && entry.value.as_u32() == 0 {
            return Err(Error::InvalidConfig(format!(
                "{}: policy {} must be greater than 0",
                scope, entry.name
            )));
        }
    }
    Ok(())
}

fn validate_filters(scope: &str, filters: &[FilterConfig]) -> Result<()> {
    for filter in filters {
        if filter.expressions.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "{}: filter {} has no expressions",
                scope, filter.name
            )));
        }
        validate_policies(&filter.name, &filter.policies)?;
    }
    Ok(())
}

fn validate_pool(link: &LinkConfig, ia_type: IaType, pool: &PoolConfig) -> Result<()> {
    let range = &pool.range;
    if range.is_ipv4() != (ia_type == IaType::V4) {
        return Err(Error::InvalidConfig(format!(
            "{} pool {} on {} is the wrong address family",
            ia_type, range, link.name
        )));
    }
    validate_policies(&link.name, &pool.policies)?;
    if let Some(filter) = &pool.filter {
        validate_filters(&link.name, std::slice::from_ref(filter))?;
    }

    if ia_type == IaType::Pd {
        let Some(length) = pool.prefix_length else {
            return Err(Error::InvalidConfig(format!(
                "prefix pool {} on {} needs a prefix_length",
                range, link.name
            )));
        };
        let range_prefix = (range.start_ordinal() ^ range.end_ordinal()).leading_zeros();
        if u32::from(length) <= range_prefix || length > 128 {
            return Err(Error::InvalidConfig(format!(
                "prefix pool {} on {}: /{} must be longer than the range prefix /{}",
                range, link.name, length, range_prefix
            )));
        }
        return Ok(());
    }

    let net = link.subnet;
    if !net.contains(&range.start()) || !net.contains(&range.end()) {
        return Err(Error::InvalidConfig(format!(
            "pool {} is outside {} ({})",
            range, link.name, net
        )));
    }
    Ok(())
}

//! Configuration policies, client filters and their resolution order.
//!
//! A policy is a named setting such as a lifetime or a feature switch. Policies
//! may be set at three levels (pool, link, global) and each level may carry
//! filters: client classes selected by matching request options, with their
//! own policies and options. Resolution walks the levels from the most to
//! the least specific and returns the first value found:
//!
//! 1. a matching filter of the pool, then the pool itself
//! 2. a matching filter of the link, then the link itself
//! 3. a matching global filter, then the global policies
//! 4. the built-in default

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::options::{DhcpOption, find_option};

/// Settings the engine reads through the policy chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// DHCPv6 preferred lifetime in seconds.
    PreferredLifetime,
    /// DHCPv6 valid lifetime in seconds.
    ValidLifetime,
    /// DHCPv4 lease time in seconds.
    V4LeaseTime,
    /// T1 as a percentage of the preferred lifetime (v6) or lease time (v4).
    T1Percent,
    /// T2 as a percentage of the preferred lifetime (v6) or lease time (v4).
    T2Percent,
    /// How long an advertised/offered lease is held before the reaper
    /// reclaims it, in seconds.
    AdvertisedLifetime,
    /// Allow two-message exchanges when the client asks for Rapid Commit.
    SupportRapidCommit,
    /// Send the Server Unicast option, authorising clients to unicast.
    ServerUnicast,
    /// Perform DDNS updates for committed bindings.
    DdnsUpdate,
    /// Seconds a declined address is quarantined; 0 keeps it forever.
    DeclineTimeout,
    /// Probe IPv4 candidates before offering them.
    PingCheck,
}

impl Policy {
    pub fn default_value(self) -> PolicyValue {
        match self {
            Self::PreferredLifetime => PolicyValue::Number(3600),
            Self::ValidLifetime => PolicyValue::Number(7200),
            Self::V4LeaseTime => PolicyValue::Number(3600),
            Self::T1Percent => PolicyValue::Number(50),
            Self::T2Percent => PolicyValue::Number(80),
            Self::AdvertisedLifetime => PolicyValue::Number(120),
            Self::SupportRapidCommit => PolicyValue::Flag(false),
            Self::ServerUnicast => PolicyValue::Flag(false),
            Self::DdnsUpdate => PolicyValue::Flag(false),
            Self::DeclineTimeout => PolicyValue::Number(0),
            Self::PingCheck => PolicyValue::Flag(false),
        }
    }

    /// Policies whose value must be a positive number of seconds.
    pub fn is_lifetime(self) -> bool {
        matches!(
            self,
            Self::PreferredLifetime
                | Self::ValidLifetime
                | Self::V4LeaseTime
                | Self::AdvertisedLifetime
        )
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PreferredLifetime => "preferred_lifetime",
            Self::ValidLifetime => "valid_lifetime",
            Self::V4LeaseTime => "v4_lease_time",
            Self::T1Percent => "t1_percent",
            Self::T2Percent => "t2_percent",
            Self::AdvertisedLifetime => "advertised_lifetime",
            Self::SupportRapidCommit => "support_rapid_commit",
            Self::ServerUnicast => "server_unicast",
            Self::DdnsUpdate => "ddns_update",
            Self::DeclineTimeout => "decline_timeout",
            Self::PingCheck => "ping_check",
        };
        write!(f, "{name}")
    }
}

/// A policy value: a number or a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyValue {
    Flag(bool),
    Number(u64),
}

impl PolicyValue {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Number(value) => u32::try_from(value).unwrap_or(u32::MAX),
            Self::Flag(flag) => u32::from(flag),
        }
    }

    pub fn as_bool(self) -> bool {
        match self {
            Self::Flag(flag) => flag,
            Self::Number(value) => value != 0,
        }
    }

    /// Returns true if the value has the same kind as the policy default.
    pub fn matches_kind_of(self, policy: Policy) -> bool {
        matches!(
            (self, policy.default_value()),
            (Self::Flag(_), PolicyValue::Flag(_)) | (Self::Number(_), PolicyValue::Number(_))
        )
    }
}

/// One configured policy setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub name: Policy,
    pub value: PolicyValue,
}

impl PolicyEntry {
    pub fn new(name: Policy, value: PolicyValue) -> Self {
        Self { name, value }
    }
}

fn lookup(policies: &[PolicyEntry], policy: Policy) -> Option<PolicyValue> {
    policies
        .iter()
        .find(|entry| entry.name == policy)
        .map(|entry| entry.value)
}

/// Comparison applied to a request option's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    StartsWith,
    Contains,
    /// The option is present, whatever its value.
    Exists,
}

/// Test of one request option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterExpression {
    pub option: u16,
    pub operator: FilterOperator,
    /// Compared byte-wise against the option value. Unused by `exists`.
    #[serde(default)]
    pub value: String,
}

impl FilterExpression {
    pub fn matches(&self, request: &[DhcpOption]) -> bool {
        let Some(option) = find_option(request, self.option) else {
            return false;
        };
        let expected = self.value.as_bytes();
        match self.operator {
            FilterOperator::Exists => true,
            FilterOperator::Equals => option.data == expected,
            FilterOperator::StartsWith => option.data.starts_with(expected),
            FilterOperator::Contains => {
                expected.is_empty() || option.data.windows(expected.len()).any(|w| w == expected)
            }
        }
    }
}

/// A client class: matched when every expression matches the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub name: String,
    pub expressions: Vec<FilterExpression>,
    #[serde(default)]
    pub policies: Vec<PolicyEntry>,
    #[serde(default)]
    pub options: Vec<DhcpOption>,
}

impl FilterConfig {
    pub fn matches(&self, request: &[DhcpOption]) -> bool {
        !self.expressions.is_empty() && self.expressions.iter().all(|e| e.matches(request))
    }
}

/// Policies, filters and options configured at one level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyLevel {
    pub policies: Vec<PolicyEntry>,
    pub filters: Vec<FilterConfig>,
    pub options: Vec<DhcpOption>,
}

impl PolicyLevel {
    pub fn new(
        policies: Vec<PolicyEntry>,
        filters: Vec<FilterConfig>,
        options: Vec<DhcpOption>,
    ) -> Self {
        Self {
            policies,
            filters,
            options,
        }
    }

    fn resolve(&self, request: &[DhcpOption], policy: Policy) -> Option<PolicyValue> {
        self.filters
            .iter()
            .filter(|filter| filter.matches(request))
            .find_map(|filter| lookup(&filter.policies, policy))
            .or_else(|| lookup(&self.policies, policy))
    }

    fn option_layers<'a>(
        &'a self,
        request: &'a [DhcpOption],
    ) -> impl Iterator<Item = &'a [DhcpOption]> {
        self.filters
            .iter()
            .filter(move |filter| filter.matches(request))
            .map(|filter| filter.options.as_slice())
            .chain(std::iter::once(self.options.as_slice()))
    }
}

/// Resolves policies and options through the pool → link → global chain.
#[derive(Debug, Clone, Default)]
pub struct PolicyResolver {
    global: PolicyLevel,
}

impl PolicyResolver {
    pub fn new(global: PolicyLevel) -> Self {
        Self { global }
    }

    pub fn global(&self) -> &PolicyLevel {
        &self.global
    }

    /// Returns the effective value of `policy` for a request.
    ///
    /// `pool` is the pool (or static binding) level and `link` the link
    /// level; either may be absent.
    pub fn effective(
        &self,
        request: &[DhcpOption],
        pool: Option<&PolicyLevel>,
        link: Option<&PolicyLevel>,
        policy: Policy,
    ) -> PolicyValue {
        [pool, link, Some(&self.global)]
            .into_iter()
            .flatten()
            .find_map(|level| level.resolve(request, policy))
            .unwrap_or_else(|| policy.default_value())
    }

    pub fn number(
        &self,
        request: &[DhcpOption],
        pool: Option<&PolicyLevel>,
        link: Option<&PolicyLevel>,
        policy: Policy,
    ) -> u32 {
        self.effective(request, pool, link, policy).as_u32()
    }

    pub fn flag(
        &self,
        request: &[DhcpOption],
        pool: Option<&PolicyLevel>,
        link: Option<&PolicyLevel>,
        policy: Policy,
    ) -> bool {
        self.effective(request, pool, link, policy).as_bool()
    }

    /// Options to send, with the same precedence as policies.
    pub fn effective_options(
        &self,
        request: &[DhcpOption],
        pool: Option<&PolicyLevel>,
        link: Option<&PolicyLevel>,
    ) -> Vec<DhcpOption> {
        let layers: Vec<&[DhcpOption]> = [pool, link, Some(&self.global)]
            .into_iter()
            .flatten()
            .flat_map(|level| level.option_layers(request))
            .collect();
        crate::options::merge_options(layers)
    }
}

/// Computes T1/T2 from a base lifetime and the percentage policies.
///
/// An infinite base yields infinite timers. T2 is never below T1.
pub fn renewal_times(base: u32, t1_percent: u32, t2_percent: u32) -> (u32, u32) {
    if base == u32::MAX {
        return (u32::MAX, u32::MAX);
    }
    let scale = |percent: u32| (u64::from(base) * u64::from(percent.min(100)) / 100) as u32;
    let t1 = scale(t1_percent);
    let t2 = scale(t2_percent).max(t1);
    (t1, t2)
}

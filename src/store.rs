//! Persisted lease records and the lease store contract.
//!
//! The store is the authority on which client holds which address. Binding
//! managers treat every store write as the commit point of a lease
//! transition and rebuild their in-memory view from it on each request.
//!
//! [`IaStore`] is the narrow interface the engine needs from a storage
//! engine. Two implementations ship with the crate: [`MemoryStore`] and
//! [`JsonFileStore`](crate::file_store::JsonFileStore).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::ClientId;
use crate::options::DhcpOption;
use crate::range::AddressRange;

/// Kind of identity association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IaType {
    /// DHCPv6 non-temporary addresses.
    Na,
    /// DHCPv6 temporary addresses.
    Ta,
    /// DHCPv6 delegated prefixes.
    Pd,
    /// DHCPv4 address; one per client.
    V4,
}

impl IaType {
    pub const ALL: [IaType; 4] = [IaType::V4, IaType::Na, IaType::Ta, IaType::Pd];

    pub fn is_v6(self) -> bool {
        self != IaType::V4
    }
}

impl fmt::Display for IaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Na => write!(f, "IA_NA"),
            Self::Ta => write!(f, "IA_TA"),
            Self::Pd => write!(f, "IA_PD"),
            Self::V4 => write!(f, "V4"),
        }
    }
}

/// Lease state of an IA or of one of its addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Advertised,
    Committed,
    Expired,
    Released,
    Declined,
    Static,
}

impl LeaseState {
    /// Released and expired records only remain when old bindings are kept;
    /// their addresses are free for reuse.
    pub fn is_reusable(self) -> bool {
        matches!(self, LeaseState::Released | LeaseState::Expired)
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Advertised => write!(f, "ADVERTISED"),
            Self::Committed => write!(f, "COMMITTED"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Released => write!(f, "RELEASED"),
            Self::Declined => write!(f, "DECLINED"),
            Self::Static => write!(f, "STATIC"),
        }
    }
}

/// Identifies one IA of one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IaKey {
    pub client_id: ClientId,
    pub ia_type: IaType,
    pub iaid: u32,
}

impl IaKey {
    pub fn new(client_id: ClientId, ia_type: IaType, iaid: u32) -> Self {
        Self {
            client_id,
            ia_type,
            iaid,
        }
    }

    /// DHCPv4 clients have exactly one IA, keyed with IAID 0.
    pub fn v4(client_id: ClientId) -> Self {
        Self::new(client_id, IaType::V4, 0)
    }
}

impl fmt::Display for IaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.client_id, self.ia_type, self.iaid)
    }
}

/// One persisted address or prefix of an IA.
///
/// A `None` end time on a [`LeaseState::Static`] record means the lease
/// never expires. Released and expired records kept for history have every
/// timestamp cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IaAddressRecord {
    pub ip: IpAddr,
    /// Set for delegated prefixes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_length: Option<u8>,
    pub start_time: Option<DateTime<Utc>>,
    pub preferred_end_time: Option<DateTime<Utc>>,
    pub valid_end_time: Option<DateTime<Utc>>,
    pub state: LeaseState,
    #[serde(default)]
    pub options: Vec<DhcpOption>,
}

impl IaAddressRecord {
    pub fn new(ip: IpAddr, prefix_length: Option<u8>, state: LeaseState) -> Self {
        Self {
            ip,
            prefix_length,
            start_time: None,
            preferred_end_time: None,
            valid_end_time: None,
            state,
            options: Vec::new(),
        }
    }

    /// Returns true once `valid_end_time` has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_end_time.is_some_and(|end| end < now)
    }

    /// Remaining preferred lifetime in seconds, `u32::MAX` for infinite.
    pub fn preferred_lifetime(&self, now: DateTime<Utc>) -> u32 {
        remaining(self.preferred_end_time, self.state, now)
    }

    /// Remaining valid lifetime in seconds, `u32::MAX` for infinite.
    pub fn valid_lifetime(&self, now: DateTime<Utc>) -> u32 {
        remaining(self.valid_end_time, self.state, now)
    }

    pub fn clear_times(&mut self) {
        self.start_time = None;
        self.preferred_end_time = None;
        self.valid_end_time = None;
    }
}

fn remaining(end: Option<DateTime<Utc>>, state: LeaseState, now: DateTime<Utc>) -> u32 {
    match end {
        None if state == LeaseState::Static => u32::MAX,
        None => 0,
        Some(end) => {
            let seconds = (end - now).num_seconds().max(0);
            u32::try_from(seconds).unwrap_or(u32::MAX - 1)
        }
    }
}

/// A persisted identity association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAssoc {
    pub key: IaKey,
    pub state: LeaseState,
    #[serde(default)]
    pub hostname: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub addresses: Vec<IaAddressRecord>,
    #[serde(default)]
    pub options: Vec<DhcpOption>,
}

impl IdentityAssoc {
    pub fn new(key: IaKey, state: LeaseState) -> Self {
        Self {
            key,
            state,
            hostname: None,
            created_at: Utc::now(),
            addresses: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn address(&self, ip: IpAddr) -> Option<&IaAddressRecord> {
        self.addresses.iter().find(|record| record.ip == ip)
    }

    /// Addresses whose valid lifetime has passed.
    pub fn expired_addresses(&self, now: DateTime<Utc>) -> impl Iterator<Item = &IaAddressRecord> {
        self.addresses.iter().filter(move |record| record.is_expired(now))
    }
}

/// Contract the binding managers require from a lease store.
///
/// Implementations must be strongly consistent per IA: a read issued after a
/// completed write observes that write. Every address may belong to at most
/// one IA, except that records in a reusable state
/// ([`LeaseState::is_reusable`]) are taken over by a new owner.
pub trait IaStore: Send + Sync + 'static {
    /// Persists a new IA.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateAddress`] if an address is held by another
    /// IA, or [`Error::Store`] if the IA already exists.
    fn create_ia(&self, ia: &IdentityAssoc) -> impl Future<Output = Result<()>> + Send;

    /// Updates an IA's own fields and applies address additions, updates
    /// and deletions.
    fn update_ia(
        &self,
        ia: &IdentityAssoc,
        added: &[IaAddressRecord],
        updated: &[IaAddressRecord],
        deleted: &[IaAddressRecord],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Replaces one address record of an IA.
    fn update_ia_address(
        &self,
        key: &IaKey,
        address: &IaAddressRecord,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Retires one address record, provided the stored record still equals
    /// `expected`. With a `replacement` the record is overwritten, otherwise
    /// it is deleted; an IA left without addresses is deleted.
    ///
    /// Returns `false` when the record changed or vanished since `expected`
    /// was read, in which case nothing is written.
    fn retire_ia_address(
        &self,
        key: &IaKey,
        expected: &IaAddressRecord,
        replacement: Option<&IaAddressRecord>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Deletes an IA and all its addresses.
    fn delete_ia(&self, key: &IaKey) -> impl Future<Output = Result<()>> + Send;

    fn find_ia(&self, key: &IaKey) -> impl Future<Output = Result<Option<IdentityAssoc>>> + Send;

    fn find_ia_by_address(
        &self,
        ip: IpAddr,
    ) -> impl Future<Output = Result<Option<IdentityAssoc>>> + Send;

    /// IAs of `ia_type` with at least one address whose valid lifetime ended
    /// before `now`.
    fn find_expired_ias(
        &self,
        ia_type: IaType,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<IdentityAssoc>>> + Send;

    /// Addresses inside `range` that are held by some IA, excluding reusable
    /// records.
    fn find_existing_ips(
        &self,
        range: &AddressRange,
    ) -> impl Future<Output = Result<Vec<IpAddr>>> + Send;

    /// Deletes every address record outside `ranges`. Returns how many
    /// records were removed.
    fn reconcile_ia_addresses(
        &self,
        ranges: &[AddressRange],
    ) -> impl Future<Output = Result<usize>> + Send;

    fn list_ias(&self) -> impl Future<Output = Result<Vec<IdentityAssoc>>> + Send;
}

/// Indexed lease records shared by the in-memory and file-backed stores.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    ias: HashMap<IaKey, IdentityAssoc>,
    by_ip: HashMap<IpAddr, IaKey>,
}

impl StoreState {
    pub(crate) fn from_ias(ias: Vec<IdentityAssoc>) -> Self {
        let mut state = Self::default();
        for ia in ias {
            for record in &ia.addresses {
                state.by_ip.insert(record.ip, ia.key.clone());
            }
            state.ias.insert(ia.key.clone(), ia);
        }
        state
    }

    pub(crate) fn snapshot(&self) -> Vec<IdentityAssoc> {
        let mut ias: Vec<IdentityAssoc> = self.ias.values().cloned().collect();
        ias.sort_by(|a, b| a.key.cmp(&b.key));
        ias
    }

    /// Verifies `ip` may be held by `key`, evicting a reusable record of a
    /// previous owner.
    fn claim(&mut self, ip: IpAddr, key: &IaKey) -> Result<()> {
        let Some(holder) = self.by_ip.get(&ip).cloned() else {
            return Ok(());
        };
        if holder == *key {
            return Ok(());
        }
        let reusable = self
            .ias
            .get(&holder)
            .and_then(|ia| ia.address(ip))
            .is_some_and(|record| record.state.is_reusable());
        if !reusable {
            return Err(Error::DuplicateAddress(ip));
        }
        debug!("Reusing {} previously held by {}", ip, holder);
        self.remove_address(&holder, ip);
        Ok(())
    }

    fn remove_address(&mut self, key: &IaKey, ip: IpAddr) -> bool {
        let Some(ia) = self.ias.get_mut(key) else {
            return false;
        };
        let before = ia.addresses.len();
        ia.addresses.retain(|record| record.ip != ip);
        let removed = ia.addresses.len() != before;
        if removed && self.by_ip.get(&ip) == Some(key) {
            self.by_ip.remove(&ip);
        }
        if ia.addresses.is_empty() {
            self.ias.remove(key);
        }
        removed
    }

    pub(crate) fn create(&mut self, ia: &IdentityAssoc) -> Result<()> {
        if self.ias.contains_key(&ia.key) {
            return Err(Error::Store(format!("{} already exists", ia.key)));
        }
        for record in &ia.addresses {
            self.check_claim(record.ip, &ia.key)?;
        }
        for record in &ia.addresses {
            self.claim(record.ip, &ia.key)?;
            self.by_ip.insert(record.ip, ia.key.clone());
        }
        self.ias.insert(ia.key.clone(), ia.clone());
        Ok(())
    }

    /// Same test as [`claim`](Self::claim) without evicting anything, so a
    /// multi-address write fails before it changes state.
    fn check_claim(&self, ip: IpAddr, key: &IaKey) -> Result<()> {
        match self.by_ip.get(&ip) {
            Some(holder) if holder != key => {
                let reusable = self
                    .ias
                    .get(holder)
                    .and_then(|ia| ia.address(ip))
                    .is_some_and(|record| record.state.is_reusable());
                if reusable {
                    Ok(())
                } else {
                    Err(Error::DuplicateAddress(ip))
                }
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn update(
        &mut self,
        ia: &IdentityAssoc,
        added: &[IaAddressRecord],
        updated: &[IaAddressRecord],
        deleted: &[IaAddressRecord],
    ) -> Result<()> {
        if !self.ias.contains_key(&ia.key) {
            return Err(Error::BindingNotFound(ia.key.to_string()));
        }
        for record in added {
            self.check_claim(record.ip, &ia.key)?;
        }
        for record in added {
            self.claim(record.ip, &ia.key)?;
        }

        let Some(stored) = self.ias.get_mut(&ia.key) else {
            return Err(Error::BindingNotFound(ia.key.to_string()));
        };
        stored.state = ia.state;
        stored.hostname = ia.hostname.clone();
        stored.options = ia.options.clone();

        for record in deleted {
            stored.addresses.retain(|existing| existing.ip != record.ip);
        }
        for record in updated {
            match stored.addresses.iter_mut().find(|existing| existing.ip == record.ip) {
                Some(existing) => *existing = record.clone(),
                None => stored.addresses.push(record.clone()),
            }
        }
        for record in added {
            stored.addresses.retain(|existing| existing.ip != record.ip);
            stored.addresses.push(record.clone());
        }
        let now_empty = stored.addresses.is_empty();

        for record in deleted {
            if self.by_ip.get(&record.ip) == Some(&ia.key) {
                self.by_ip.remove(&record.ip);
            }
        }
        for record in added.iter().chain(updated) {
            self.by_ip.insert(record.ip, ia.key.clone());
        }
        if now_empty {
            self.ias.remove(&ia.key);
        }
        Ok(())
    }

    pub(crate) fn update_address(&mut self, key: &IaKey, address: &IaAddressRecord) -> Result<()> {
        let ia = self
            .ias
            .get_mut(key)
            .ok_or_else(|| Error::BindingNotFound(key.to_string()))?;
        let existing = ia
            .addresses
            .iter_mut()
            .find(|record| record.ip == address.ip)
            .ok_or_else(|| Error::BindingNotFound(format!("{key} address {}", address.ip)))?;
        *existing = address.clone();
        Ok(())
    }

    pub(crate) fn retire_address(
        &mut self,
        key: &IaKey,
        expected: &IaAddressRecord,
        replacement: Option<&IaAddressRecord>,
    ) -> bool {
        let unchanged = self
            .ias
            .get(key)
            .and_then(|ia| ia.address(expected.ip))
            .is_some_and(|record| record == expected);
        if !unchanged {
            return false;
        }
        match replacement {
            Some(kept) => self
                .ias
                .get_mut(key)
                .and_then(|ia| ia.addresses.iter_mut().find(|record| record.ip == expected.ip))
                .map(|record| *record = kept.clone())
                .is_some(),
            None => self.remove_address(key, expected.ip),
        }
    }

    pub(crate) fn delete(&mut self, key: &IaKey) -> Result<()> {
        let ia = self
            .ias
            .remove(key)
            .ok_or_else(|| Error::BindingNotFound(key.to_string()))?;
        for record in ia.addresses {
            if self.by_ip.get(&record.ip) == Some(key) {
                self.by_ip.remove(&record.ip);
            }
        }
        Ok(())
    }

    pub(crate) fn find(&self, key: &IaKey) -> Option<IdentityAssoc> {
        self.ias.get(key).cloned()
    }

    pub(crate) fn find_by_address(&self, ip: IpAddr) -> Option<IdentityAssoc> {
        self.by_ip.get(&ip).and_then(|key| self.ias.get(key)).cloned()
    }

    pub(crate) fn expired(&self, ia_type: IaType, now: DateTime<Utc>) -> Vec<IdentityAssoc> {
        self.ias
            .values()
            .filter(|ia| ia.key.ia_type == ia_type)
            .filter(|ia| ia.expired_addresses(now).next().is_some())
            .cloned()
            .collect()
    }

    pub(crate) fn existing_ips(&self, range: &AddressRange) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self
            .by_ip
            .iter()
            .filter(|(ip, _)| range.contains(**ip))
            .filter(|(ip, key)| {
                self.ias
                    .get(*key)
                    .and_then(|ia| ia.address(**ip))
                    .is_some_and(|record| !record.state.is_reusable())
            })
            .map(|(ip, _)| *ip)
            .collect();
        ips.sort();
        ips
    }

    pub(crate) fn reconcile(&mut self, ranges: &[AddressRange]) -> usize {
        let stale: Vec<(IaKey, IpAddr)> = self
            .by_ip
            .iter()
            .filter(|(ip, _)| !ranges.iter().any(|range| range.contains(**ip)))
            .map(|(ip, key)| (key.clone(), *ip))
            .collect();

        let mut removed = 0;
        for (key, ip) in stale {
            if self.remove_address(&key, ip) {
                debug!("Removed {} of {}: outside every configured range", ip, key);
                removed += 1;
            }
        }
        removed
    }
}

/// Lease store kept entirely in memory.
///
/// Useful for tests and for deployments that accept losing leases on
/// restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IaStore for MemoryStore {
    async fn create_ia(&self, ia: &IdentityAssoc) -> Result<()> {
        self.state.write().await.create(ia)
    }

    async fn update_ia(
        &self,
        ia: &IdentityAssoc,
        added: &[IaAddressRecord],
        updated: &[IaAddressRecord],
        deleted: &[IaAddressRecord],
    ) -> Result<()> {
        self.state.write().await.update(ia, added, updated, deleted)
    }

    async fn update_ia_address(&self, key: &IaKey, address: &IaAddressRecord) -> Result<()> {
        self.state.write().await.update_address(key, address)
    }

    async fn retire_ia_address(
        &self,
        key: &IaKey,
        expected: &IaAddressRecord,
        replacement: Option<&IaAddressRecord>,
    ) -> Result<bool> {
        Ok(self
            .state
            .write()
            .await
            .retire_address(key, expected, replacement))
    }

    async fn delete_ia(&self, key: &IaKey) -> Result<()> {
        self.state.write().await.delete(key)
    }

    async fn find_ia(&self, key: &IaKey) -> Result<Option<IdentityAssoc>> {
        Ok(self.state.read().await.find(key))
    }

    async fn find_ia_by_address(&self, ip: IpAddr) -> Result<Option<IdentityAssoc>> {
        Ok(self.state.read().await.find_by_address(ip))
    }

    async fn find_expired_ias(
        &self,
        ia_type: IaType,
        now: DateTime<Utc>,
    ) -> Result<Vec<IdentityAssoc>> {
        Ok(self.state.read().await.expired(ia_type, now))
    }

    async fn find_existing_ips(&self, range: &AddressRange) -> Result<Vec<IpAddr>> {
        Ok(self.state.read().await.existing_ips(range))
    }

    async fn reconcile_ia_addresses(&self, ranges: &[AddressRange]) -> Result<usize> {
        Ok(self.state.write().await.reconcile(ranges))
    }

    async fn list_ias(&self) -> Result<Vec<IdentityAssoc>> {
        Ok(self.state.read().await.snapshot())
    }
}

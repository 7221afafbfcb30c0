//! Binding managers: one per IA type, turning client requests into
//! persisted leases.
//!
//! A manager resolves static reservations before pools, allocates from the
//! link's pools, writes every lease transition to the store and only then
//! touches pool state, so that a failed write never leaks or double-frees an
//! address. Expired leases are reclaimed by [`reap_expired`](BindingManager::reap_expired),
//! normally driven by [`spawn_reaper`](crate::reaper::spawn_reaper).

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::binding::{Binding, BindingObject, BindingObjectOps, BindingOwner};
use crate::ddns::{DdnsRequest, DdnsUpdater};
use crate::error::{Error, Result};
use crate::link::{Link, LinkMap};
use crate::message::{DhcpV4Message, DhcpV6Message};
use crate::options::DhcpOption;
use crate::policy::{Policy, PolicyResolver, renewal_times};
use crate::pool::{BindingPool, ReachabilityProbe};
use crate::store::{IaAddressRecord, IaKey, IaStore, IaType, IdentityAssoc, LeaseState};

/// What the engine needs to know about the client behind a request.
#[derive(Debug, Clone, Default)]
pub struct ClientRequest {
    /// Request options, matched by filters.
    pub options: Vec<DhcpOption>,
    /// DHCPv4 chaddr, for MAC reservations.
    pub hardware: Option<Vec<u8>>,
    /// Client FQDN or hostname, for DDNS.
    pub fqdn: Option<String>,
}

impl ClientRequest {
    pub fn from_v6(message: &DhcpV6Message) -> Self {
        Self {
            options: message.options.clone(),
            hardware: None,
            fqdn: message.fqdn(),
        }
    }

    pub fn from_v4(message: &DhcpV4Message) -> Self {
        Self {
            options: message.options.clone(),
            hardware: Some(message.chaddr_bytes().to_vec()),
            fqdn: message
                .fqdn()
                .or_else(|| message.hostname().map(str::to_string)),
        }
    }
}

/// Lifetimes and renewal timers, in seconds. `u32::MAX` is infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTimes {
    pub preferred: u32,
    pub valid: u32,
    pub t1: u32,
    pub t2: u32,
}

impl LeaseTimes {
    pub const INFINITE: LeaseTimes = LeaseTimes {
        preferred: u32::MAX,
        valid: u32::MAX,
        t1: u32::MAX,
        t2: u32::MAX,
    };
}

/// Store-related settings shared by all managers.
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    /// Delete released and expired records instead of keeping them with
    /// cleared timestamps.
    pub delete_old_bindings: bool,
    pub store_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            delete_old_bindings: true,
            store_timeout: Duration::from_millis(5000),
        }
    }
}

/// Clears the reaper flag even if a sweep is cancelled.
struct ReapGuard<'a>(&'a AtomicBool);

impl Drop for ReapGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Lease engine for one IA type.
pub struct BindingManager<S> {
    ia_type: IaType,
    store: Arc<S>,
    links: Arc<LinkMap>,
    policies: Arc<PolicyResolver>,
    ddns: Arc<dyn DdnsUpdater>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    settings: ManagerSettings,
    reaping: AtomicBool,
}

impl<S: IaStore> BindingManager<S> {
    pub fn new(
        ia_type: IaType,
        store: Arc<S>,
        links: Arc<LinkMap>,
        policies: Arc<PolicyResolver>,
        ddns: Arc<dyn DdnsUpdater>,
        probe: Option<Arc<dyn ReachabilityProbe>>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            ia_type,
            store,
            links,
            policies,
            ddns,
            probe,
            settings,
            reaping: AtomicBool::new(false),
        }
    }

    pub fn ia_type(&self) -> IaType {
        self.ia_type
    }

    pub fn policies(&self) -> &PolicyResolver {
        &self.policies
    }

    async fn timed<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.settings.store_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(Error::StoreTimeout(self.settings.store_timeout)),
        }
    }

    /// Marks every address the store already holds, and every reserved
    /// address, as used in this manager's pools.
    ///
    /// # Errors
    ///
    /// Returns a store error if existing leases cannot be read.
    pub async fn init(&self) -> Result<()> {
        for link in self.links.links() {
            for pool in link.pools(self.ia_type) {
                let existing = self
                    .timed(self.store.find_existing_ips(pool.range()))
                    .await?;
                for ip in existing {
                    pool.claim(ip);
                }
                for reserved in link.statics(self.ia_type) {
                    pool.claim(reserved.address());
                }
                info!(
                    "{} pool {} on {}: {} of {} in use",
                    self.ia_type,
                    pool,
                    link.name(),
                    pool.used_count(),
                    pool.size()
                );
            }
        }
        Ok(())
    }

    /// Loads the client's IA and joins it with `link`'s configuration.
    ///
    /// Returns `None` when the client holds no live lease. Records that are
    /// not valid on `link` are kept aside in [`Binding::stale`].
    pub async fn find_current_binding(
        &self,
        link: &Arc<Link>,
        key: &IaKey,
        request: &ClientRequest,
    ) -> Result<Option<Binding>> {
        let Some(ia) = self.timed(self.store.find_ia(key)).await? else {
            return Ok(None);
        };

        let mut binding = Binding::new(key.clone(), Arc::clone(link), ia.state);
        binding.hostname = ia.hostname;
        binding.options = ia.options;
        binding.created_at = ia.created_at;

        for record in ia.addresses {
            if record.state.is_reusable() || record.state == LeaseState::Declined {
                continue;
            }
            match link.owner_of(key, record.ip, request.hardware.as_deref()) {
                Some(owner) => binding.objects.push(BindingObject::new(record, owner)),
                None => {
                    warn!("{} of {} is not valid on link {}", record.ip, key, link.name());
                    binding.stale.push(record);
                }
            }
        }

        if binding.objects.is_empty() && binding.stale.is_empty() {
            return Ok(None);
        }
        Ok(Some(binding))
    }

    /// Creates a binding for a client without one.
    ///
    /// A matching reservation is used first. Otherwise pools are tried with
    /// filtered pools first, taking a free hinted address when there is one.
    /// Returns `None` when every eligible pool is exhausted.
    pub async fn create_binding(
        &self,
        link: &Arc<Link>,
        key: &IaKey,
        hints: &[IpAddr],
        request: &ClientRequest,
        state: LeaseState,
    ) -> Result<Option<Binding>> {
        let now = Utc::now();
        let Some(mut object) = self.new_object(link, key, hints, request, state) else {
            info!("No free {} addresses on {} for {}", self.ia_type, link.name(), key);
            return Ok(None);
        };
        self.apply_lease(&mut object, link, state, request, now);

        let mut binding = Binding::new(key.clone(), Arc::clone(link), object.state());
        binding.hostname = request.fqdn.clone();
        binding.objects.push(object);
        let ia = binding.to_ia();

        let result = match self.timed(self.store.find_ia(key)).await {
            Ok(Some(existing)) => {
                let reusable: Vec<IaAddressRecord> = existing
                    .addresses
                    .into_iter()
                    .filter(|record| record.state.is_reusable())
                    .collect();
                self.timed(self.store.update_ia(&ia, &ia.addresses, &[], &reusable))
                    .await
            }
            Ok(None) => self.timed(self.store.create_ia(&ia)).await,
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            self.roll_back(&binding.objects);
            return Err(error);
        }

        for object in &binding.objects {
            info!("{} {} to {} on {}", object.state(), object.ip(), key, link.name());
        }
        if binding.state == LeaseState::Committed {
            self.ddns_update(&binding, request);
        }
        Ok(Some(binding))
    }

    /// Renews or re-advertises an existing binding.
    ///
    /// Objects still valid on the link get fresh lifetimes; stale records are
    /// deleted. When nothing is left a new address is allocated. Advertising
    /// again never downgrades a committed object.
    pub async fn update_binding(
        &self,
        binding: Binding,
        link: &Arc<Link>,
        hints: &[IpAddr],
        request: &ClientRequest,
        state: LeaseState,
    ) -> Result<Option<Binding>> {
        let now = Utc::now();
        let mut binding = binding;
        binding.link = Arc::clone(link);

        let mut updated = Vec::new();
        for object in &mut binding.objects {
            if state == LeaseState::Advertised && object.state() == LeaseState::Committed {
                continue;
            }
            self.apply_lease(object, link, state, request, now);
            updated.push(object.record().clone());
        }

        let mut added = Vec::new();
        if binding.objects.is_empty() {
            if let Some(mut object) = self.new_object(link, &binding.key, hints, request, state) {
                self.apply_lease(&mut object, link, state, request, now);
                added.push(object.record().clone());
                binding.objects.push(object);
            } else {
                info!("No free {} addresses on {} for {}", self.ia_type, link.name(), binding.key);
            }
        }

        let deleted = std::mem::take(&mut binding.stale);
        binding.state = ia_state(&binding.objects, state);
        if request.fqdn.is_some() {
            binding.hostname = request.fqdn.clone();
        }

        let ia = binding.to_ia();
        if let Err(error) = self
            .timed(self.store.update_ia(&ia, &added, &updated, &deleted))
            .await
        {
            let fresh: Vec<BindingObject> = binding
                .objects
                .iter()
                .filter(|object| added.iter().any(|record| record.ip == object.ip()))
                .cloned()
                .collect();
            self.roll_back(&fresh);
            return Err(error);
        }

        for record in &deleted {
            if let Some(pool) = self.links.find_pool(self.ia_type, record.ip) {
                pool.free(record.ip);
            }
            debug!("Removed stale {} from {}", record.ip, binding.key);
        }

        if binding.objects.is_empty() {
            return Ok(None);
        }
        if binding.state == LeaseState::Committed {
            self.ddns_update(&binding, request);
        }
        Ok(Some(binding))
    }

    /// Releases one object of a binding.
    ///
    /// The store is updated first and the address is returned to its pool
    /// only after the write succeeds. Releasing an object that is already
    /// released, or gone, does nothing.
    pub async fn release_ia_address(
        &self,
        binding: &Binding,
        object: &BindingObject,
    ) -> Result<()> {
        let ip = object.ip();
        let current = self.timed(self.store.find_ia(&binding.key)).await?;
        let Some(record) = current.as_ref().and_then(|ia| ia.address(ip)) else {
            debug!("{} of {} already released", ip, binding.key);
            return Ok(());
        };
        if record.state.is_reusable() {
            debug!("{} of {} already released", ip, binding.key);
            return Ok(());
        }

        self.ddns_delete(
            &binding.key,
            binding.hostname.as_deref(),
            record,
            Some(&binding.link),
        );
        self.retire(&binding.key, record, Some(object.owner()), LeaseState::Released)
            .await?;
        Ok(())
    }

    /// Marks an object declined. The address is never returned to the pool
    /// here; with a non-zero `DeclineTimeout` the reaper reclaims it later.
    pub async fn decline_ia_address(
        &self,
        binding: &Binding,
        object: &BindingObject,
    ) -> Result<()> {
        let now = Utc::now();
        let timeout = self.policies.number(
            &binding.options,
            Some(object.owner().policy_level()),
            Some(binding.link.policy_level()),
            Policy::DeclineTimeout,
        );

        let mut record = object.record().clone();
        self.ddns_delete(&binding.key, binding.hostname.as_deref(), &record, Some(&binding.link));
        record.state = LeaseState::Declined;
        record.start_time = Some(now);
        record.preferred_end_time = None;
        record.valid_end_time = (timeout > 0).then(|| now + TimeDelta::seconds(i64::from(timeout)));

        self.timed(self.store.update_ia_address(&binding.key, &record))
            .await?;
        warn!("{} declined by {}", record.ip, binding.key);
        Ok(())
    }

    /// Expires every address of `ia` whose valid lifetime has passed.
    ///
    /// Equivalent to a release, except the kept record is marked expired.
    /// Records renewed or released since `ia` was read are left alone.
    pub async fn expire_ia(&self, ia: &IdentityAssoc) -> Result<usize> {
        let now = Utc::now();
        let current = self.timed(self.store.find_ia(&ia.key)).await?;
        let mut expired = 0;
        for record in ia.expired_addresses(now) {
            if current.as_ref().and_then(|stored| stored.address(record.ip)) != Some(record) {
                debug!("{} of {} changed since the sweep began", record.ip, ia.key);
                continue;
            }
            if record.state != LeaseState::Declined {
                self.ddns_delete(&ia.key, ia.hostname.as_deref(), record, None);
            }
            let owner = self
                .links
                .find_pool(self.ia_type, record.ip)
                .map(BindingOwner::Pool);
            if self
                .retire(&ia.key, record, owner.as_ref(), LeaseState::Expired)
                .await?
            {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Runs one expiry sweep. A sweep already in progress makes this a
    /// no-op returning zero.
    pub async fn reap_expired(&self) -> Result<usize> {
        if self
            .reaping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("{} reaper still running, skipping", self.ia_type);
            return Ok(0);
        }
        let _guard = ReapGuard(&self.reaping);

        let expired = self
            .timed(self.store.find_expired_ias(self.ia_type, Utc::now()))
            .await?;
        let mut count = 0;
        for ia in &expired {
            match self.expire_ia(ia).await {
                Ok(n) => count += n,
                Err(error) => warn!("Failed to expire {}: {}", ia.key, error),
            }
        }
        if count > 0 {
            info!("Expired {} {} leases", count, self.ia_type);
        }
        Ok(count)
    }

    /// Sends forward and reverse DNS updates for a committed binding.
    ///
    /// Failures are logged and otherwise ignored.
    pub fn ddns_update(&self, binding: &Binding, request: &ClientRequest) {
        if self.ia_type == IaType::Pd {
            return;
        }
        let Some(fqdn) = request.fqdn.as_deref().or(binding.hostname.as_deref()) else {
            return;
        };
        let now = Utc::now();
        for object in &binding.objects {
            if !matches!(object.state(), LeaseState::Committed | LeaseState::Static) {
                continue;
            }
            let enabled = self.policies.flag(
                &request.options,
                Some(object.owner().policy_level()),
                Some(binding.link.policy_level()),
                Policy::DdnsUpdate,
            );
            if !enabled {
                continue;
            }
            let ddns_request = DdnsRequest {
                fqdn: fqdn.to_string(),
                ip: object.ip(),
                client_id: binding.key.client_id.clone(),
                lifetime: object.record().valid_lifetime(now),
            };
            if let Err(error) = self.ddns.update(&ddns_request) {
                warn!("DDNS update for {} failed: {}", fqdn, error);
            }
        }
    }

    /// Lifetimes granted for an object, resolved through the policy chain.
    pub fn lease_times(
        &self,
        link: &Link,
        owner: &BindingOwner,
        request: &ClientRequest,
    ) -> LeaseTimes {
        if owner.is_static() {
            return LeaseTimes::INFINITE;
        }
        let pool_level = Some(owner.policy_level());
        let link_level = Some(link.policy_level());
        let number = |policy| {
            self.policies
                .number(&request.options, pool_level, link_level, policy)
        };

        let (preferred, valid) = if self.ia_type == IaType::V4 {
            let lease_time = number(Policy::V4LeaseTime);
            (lease_time, lease_time)
        } else {
            let valid = number(Policy::ValidLifetime);
            (number(Policy::PreferredLifetime).min(valid), valid)
        };
        let (t1, t2) = renewal_times(
            preferred,
            number(Policy::T1Percent),
            number(Policy::T2Percent),
        );
        LeaseTimes {
            preferred,
            valid,
            t1,
            t2,
        }
    }

    fn apply_lease(
        &self,
        object: &mut BindingObject,
        link: &Link,
        state: LeaseState,
        request: &ClientRequest,
        now: DateTime<Utc>,
    ) {
        if object.owner().is_static() {
            object.set_lease(LeaseState::Static, now, None, None);
            return;
        }
        let times = self.lease_times(link, object.owner(), request);
        if state == LeaseState::Advertised {
            let held = self
                .policies
                .number(
                    &request.options,
                    Some(object.owner().policy_level()),
                    Some(link.policy_level()),
                    Policy::AdvertisedLifetime,
                )
                .min(times.valid);
            object.set_lease(state, now, Some(held), Some(held));
        } else {
            object.set_lease(state, now, Some(times.preferred), Some(times.valid));
        }
    }

    /// Picks the reservation or a pool address for a new object.
    fn new_object(
        &self,
        link: &Link,
        key: &IaKey,
        hints: &[IpAddr],
        request: &ClientRequest,
        state: LeaseState,
    ) -> Option<BindingObject> {
        if let Some(reserved) = link.find_static(key, request.hardware.as_deref()) {
            let record = IaAddressRecord::new(
                reserved.address(),
                reserved.prefix_length(),
                LeaseState::Static,
            );
            return Some(BindingObject::new(record, BindingOwner::Static(Arc::clone(reserved))));
        }

        let (pool, ip) = self.allocate(link, hints, request)?;
        let record = IaAddressRecord::new(ip, pool.prefix_length(), state);
        Some(BindingObject::new(record, BindingOwner::Pool(pool)))
    }

    fn allocate(
        &self,
        link: &Link,
        hints: &[IpAddr],
        request: &ClientRequest,
    ) -> Option<(Arc<BindingPool>, IpAddr)> {
        let mut pools: Vec<&Arc<BindingPool>> = link
            .pools(self.ia_type)
            .iter()
            .filter(|pool| pool.accepts(&request.options))
            .collect();
        pools.sort_by_key(|pool| !pool.is_filtered());

        for hint in hints {
            if let Some(pool) = pools.iter().find(|pool| pool.contains(*hint))
                && pool.claim(*hint)
            {
                return Some((Arc::clone(*pool), *hint));
            }
        }

        for pool in pools {
            let ping = self.ia_type == IaType::V4
                && self.policies.flag(
                    &request.options,
                    Some(pool.policy_level()),
                    Some(link.policy_level()),
                    Policy::PingCheck,
                );
            let probe = if ping { self.probe.as_deref() } else { None };
            if let Some(ip) = pool.next_available(probe) {
                return Some((Arc::clone(pool), ip));
            }
        }
        None
    }

    fn roll_back(&self, objects: &[BindingObject]) {
        for object in objects {
            if object.owner().free(object.ip()) {
                debug!("Rolled back allocation of {}", object.ip());
            }
        }
    }

    /// Deletes or marks a record released/expired, then frees its address.
    /// Returns `false` without freeing anything when the stored record no
    /// longer matches `record`.
    async fn retire(
        &self,
        key: &IaKey,
        record: &IaAddressRecord,
        owner: Option<&BindingOwner>,
        state: LeaseState,
    ) -> Result<bool> {
        let kept = (!self.settings.delete_old_bindings).then(|| {
            let mut kept = record.clone();
            kept.state = state;
            kept.clear_times();
            kept
        });
        let retired = self
            .timed(self.store.retire_ia_address(key, record, kept.as_ref()))
            .await?;
        if !retired {
            debug!("{} of {} changed since it was read, leaving it", record.ip, key);
            return Ok(false);
        }
        if let Some(owner) = owner {
            owner.free(record.ip);
        }
        info!("{} {} of {}", state, record.ip, key);
        Ok(true)
    }

    fn ddns_delete(
        &self,
        key: &IaKey,
        hostname: Option<&str>,
        record: &IaAddressRecord,
        link: Option<&Arc<Link>>,
    ) {
        if self.ia_type == IaType::Pd {
            return;
        }
        let Some(fqdn) = hostname else {
            return;
        };
        let link = link
            .cloned()
            .or_else(|| self.links.find_by_address(record.ip));
        let enabled = self.policies.flag(
            &[],
            link.as_ref()
                .and_then(|link| link.find_pool(self.ia_type, record.ip))
                .map(|pool| pool.policy_level()),
            link.as_ref().map(|link| link.policy_level()),
            Policy::DdnsUpdate,
        );
        if !enabled {
            return;
        }
        let request = DdnsRequest {
            fqdn: fqdn.to_string(),
            ip: record.ip,
            client_id: key.client_id.clone(),
            lifetime: 0,
        };
        if let Err(error) = self.ddns.delete(&request) {
            warn!("DDNS delete for {} failed: {}", fqdn, error);
        }
    }
}

/// State of an IA from its objects: committed if any object is.
fn ia_state(objects: &[BindingObject], fallback: LeaseState) -> LeaseState {
    if objects.iter().any(|o| o.state() == LeaseState::Committed) {
        LeaseState::Committed
    } else if !objects.is_empty() && objects.iter().all(|o| o.state() == LeaseState::Static) {
        LeaseState::Static
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddns::NoopDdns;
    use crate::message::ClientId;
    use crate::policy::{PolicyEntry, PolicyLevel, PolicyValue};
    use crate::pool::PoolKind;
    use crate::range::AddressRange;
    use crate::static_binding::{ClientMatch, StaticBinding};
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    struct Fixture {
        store: Arc<MemoryStore>,
        manager: BindingManager<MemoryStore>,
        link: Arc<Link>,
    }

    fn lan(statics: Vec<StaticBinding>) -> Link {
        let mut link = Link::new("lan", "10.0.0.0/24".parse().unwrap(), PolicyLevel::default());
        link.add_pool(
            IaType::V4,
            BindingPool::new(
                "lan-pool",
                PoolKind::V4Address,
                AddressRange::parse("10.0.0.10-10.0.0.12").unwrap(),
                PolicyLevel::default(),
                None,
            )
            .unwrap(),
        );
        for binding in statics {
            link.add_static(binding);
        }
        link
    }

    async fn fixture(link: Link, settings: ManagerSettings, policies: PolicyResolver) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let links = Arc::new(LinkMap::new(vec![link]));
        let manager = BindingManager::new(
            IaType::V4,
            Arc::clone(&store),
            Arc::clone(&links),
            Arc::new(policies),
            Arc::new(NoopDdns),
            None,
            settings,
        );
        manager.init().await.unwrap();
        let link = links.links()[0].clone();
        Fixture {
            store,
            manager,
            link,
        }
    }

    fn client(n: u8) -> IaKey {
        IaKey::v4(ClientId::new(vec![1, 0, 0, 0, 0, 0, n]))
    }

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    #[tokio::test]
    async fn test_three_addresses_then_exhaustion() {
        let f = fixture(lan(vec![]), ManagerSettings::default(), PolicyResolver::default()).await;
        let request = ClientRequest::default();

        let mut seen = Vec::new();
        for n in 1..=3 {
            let binding = f
                .manager
                .create_binding(&f.link, &client(n), &[], &request, LeaseState::Committed)
                .await
                .unwrap()
                .unwrap();
            seen.extend(binding.ips());
        }
        seen.sort();
        assert_eq!(seen, vec![ip("10.0.0.10"), ip("10.0.0.11"), ip("10.0.0.12")]);

        let fourth = f
            .manager
            .create_binding(&f.link, &client(4), &[], &request, LeaseState::Committed)
            .await
            .unwrap();
        assert!(fourth.is_none());
    }

    #[tokio::test]
    async fn test_hint_honoured_when_free() {
        let f = fixture(lan(vec![]), ManagerSettings::default(), PolicyResolver::default()).await;
        let binding = f
            .manager
            .create_binding(
                &f.link,
                &client(1),
                &[ip("10.0.0.12")],
                &ClientRequest::default(),
                LeaseState::Advertised,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(binding.ips(), vec![ip("10.0.0.12")]);
        assert_eq!(binding.state, LeaseState::Advertised);

        let stored = f.store.find_ia(&client(1)).await.unwrap().unwrap();
        let held = stored.addresses[0].valid_lifetime(Utc::now());
        assert!((119..=120).contains(&held));
    }

    #[tokio::test]
    async fn test_static_precedence_over_pool() {
        let key = client(7);
        let reservation = StaticBinding::new(
            ClientMatch::ClientId(key.client_id.clone()),
            ip("10.0.0.11"),
            None,
            PolicyLevel::default(),
        );
        let f = fixture(
            lan(vec![reservation]),
            ManagerSettings::default(),
            PolicyResolver::default(),
        )
        .await;

        let binding = f
            .manager
            .create_binding(
                &f.link,
                &key,
                &[ip("10.0.0.10")],
                &ClientRequest::default(),
                LeaseState::Committed,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(binding.ips(), vec![ip("10.0.0.11")]);
        assert_eq!(binding.state, LeaseState::Static);
        assert_eq!(binding.objects[0].record().valid_lifetime(Utc::now()), u32::MAX);

        // The reserved address is never handed to anybody else.
        let request = ClientRequest::default();
        for n in 1..=2 {
            let other = f
                .manager
                .create_binding(
                    &f.link,
                    &client(n),
                    &[ip("10.0.0.11")],
                    &request,
                    LeaseState::Committed,
                )
                .await
                .unwrap()
                .unwrap();
            assert_ne!(other.ips(), vec![ip("10.0.0.11")]);
        }
    }

    #[tokio::test]
    async fn test_find_and_update_extends_lease() {
        let f = fixture(lan(vec![]), ManagerSettings::default(), PolicyResolver::default()).await;
        let request = ClientRequest::default();
        f.manager
            .create_binding(&f.link, &client(1), &[], &request, LeaseState::Advertised)
            .await
            .unwrap();

        let binding = f
            .manager
            .find_current_binding(&f.link, &client(1), &request)
            .await
            .unwrap()
            .unwrap();
        let updated = f
            .manager
            .update_binding(binding, &f.link, &[], &request, LeaseState::Committed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, LeaseState::Committed);

        let stored = f.store.find_ia(&client(1)).await.unwrap().unwrap();
        assert_eq!(stored.state, LeaseState::Committed);
        assert_eq!(stored.addresses.len(), 1);
        assert!(stored.addresses[0].valid_lifetime(Utc::now()) > 3500);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let f = fixture(lan(vec![]), ManagerSettings::default(), PolicyResolver::default()).await;
        let request = ClientRequest::default();
        let binding = f
            .manager
            .create_binding(&f.link, &client(1), &[], &request, LeaseState::Committed)
            .await
            .unwrap()
            .unwrap();
        let object = binding.objects[0].clone();

        f.manager.release_ia_address(&binding, &object).await.unwrap();
        f.manager.release_ia_address(&binding, &object).await.unwrap();

        assert!(f.store.find_ia(&client(1)).await.unwrap().is_none());
        let pool = &f.link.pools(IaType::V4)[0];
        assert_eq!(pool.used_count(), 0);
    }

    #[tokio::test]
    async fn test_release_keeps_record_when_configured() {
        let settings = ManagerSettings {
            delete_old_bindings: false,
            ..ManagerSettings::default()
        };
        let f = fixture(lan(vec![]), settings, PolicyResolver::default()).await;
        let request = ClientRequest::default();
        let binding = f
            .manager
            .create_binding(
                &f.link,
                &client(1),
                &[ip("10.0.0.11")],
                &request,
                LeaseState::Committed,
            )
            .await
            .unwrap()
            .unwrap();
        f.manager
            .release_ia_address(&binding, &binding.objects[0])
            .await
            .unwrap();

        let stored = f.store.find_ia(&client(1)).await.unwrap().unwrap();
        let record = stored.address(ip("10.0.0.11")).unwrap();
        assert_eq!(record.state, LeaseState::Released);
        assert!(record.start_time.is_none());
        assert!(record.preferred_end_time.is_none());
        assert!(record.valid_end_time.is_none());

        let next = f
            .manager
            .create_binding(
                &f.link,
                &client(2),
                &[ip("10.0.0.11")],
                &request,
                LeaseState::Committed,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.ips(), vec![ip("10.0.0.11")]);
    }

    #[tokio::test]
    async fn test_expiry_matches_release() {
        let f = fixture(lan(vec![]), ManagerSettings::default(), PolicyResolver::default()).await;
        let request = ClientRequest::default();
        let released = f
            .manager
            .create_binding(&f.link, &client(1), &[], &request, LeaseState::Committed)
            .await
            .unwrap()
            .unwrap();
        let expiring = f
            .manager
            .create_binding(&f.link, &client(2), &[], &request, LeaseState::Committed)
            .await
            .unwrap()
            .unwrap();

        let mut record = expiring.objects[0].record().clone();
        record.valid_end_time = Some(Utc::now() - TimeDelta::seconds(1));
        f.store.update_ia_address(&client(2), &record).await.unwrap();

        f.manager
            .release_ia_address(&released, &released.objects[0])
            .await
            .unwrap();
        assert_eq!(f.manager.reap_expired().await.unwrap(), 1);

        assert!(f.store.find_ia(&client(1)).await.unwrap().is_none());
        assert!(f.store.find_ia(&client(2)).await.unwrap().is_none());
        let pool = &f.link.pools(IaType::V4)[0];
        assert!(pool.is_free(released.ips()[0]));
        assert!(pool.is_free(expiring.ips()[0]));
    }

    #[tokio::test]
    async fn test_expiry_leaves_lease_renewed_after_sweep_snapshot() {
        let f = fixture(lan(vec![]), ManagerSettings::default(), PolicyResolver::default()).await;
        let request = ClientRequest::default();
        let binding = f
            .manager
            .create_binding(&f.link, &client(1), &[], &request, LeaseState::Committed)
            .await
            .unwrap()
            .unwrap();
        let held = binding.ips()[0];
        let mut record = binding.objects[0].record().clone();
        record.valid_end_time = Some(Utc::now() - TimeDelta::seconds(1));
        f.store.update_ia_address(&client(1), &record).await.unwrap();

        let stale = f
            .store
            .find_expired_ias(IaType::V4, Utc::now())
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);

        let current = f
            .manager
            .find_current_binding(&f.link, &client(1), &request)
            .await
            .unwrap()
            .unwrap();
        f.manager
            .update_binding(current, &f.link, &[], &request, LeaseState::Committed)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.manager.expire_ia(&stale[0]).await.unwrap(), 0);
        let stored = f.store.find_ia(&client(1)).await.unwrap().unwrap();
        assert!(stored.addresses[0].valid_lifetime(Utc::now()) > 3500);
        assert!(!f.link.pools(IaType::V4)[0].is_free(held));

        let other = f
            .manager
            .create_binding(&f.link, &client(2), &[], &request, LeaseState::Committed)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(other.ips(), vec![held]);
    }

    #[tokio::test]
    async fn test_duplicate_release_does_not_free_reallocated_address() {
        let f = fixture(lan(vec![]), ManagerSettings::default(), PolicyResolver::default()).await;
        let request = ClientRequest::default();
        let binding = f
            .manager
            .create_binding(&f.link, &client(1), &[], &request, LeaseState::Committed)
            .await
            .unwrap()
            .unwrap();
        let object = binding.objects[0].clone();
        // Both releases read the committed record before either writes.
        let seen = f
            .store
            .find_ia(&client(1))
            .await
            .unwrap()
            .unwrap()
            .addresses[0]
            .clone();

        f.manager.release_ia_address(&binding, &object).await.unwrap();
        let next = f
            .manager
            .create_binding(&f.link, &client(2), &[], &request, LeaseState::Committed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.ips(), binding.ips());

        let retired = f
            .manager
            .retire(&client(1), &seen, Some(object.owner()), LeaseState::Released)
            .await
            .unwrap();
        assert!(!retired);
        let pool = &f.link.pools(IaType::V4)[0];
        assert!(!pool.is_free(seen.ip));
        assert_eq!(pool.used_count(), 1);
        assert!(f.store.find_ia(&client(2)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_releases_free_once() {
        let settings = ManagerSettings {
            delete_old_bindings: false,
            ..ManagerSettings::default()
        };
        let f = fixture(lan(vec![]), settings, PolicyResolver::default()).await;
        let request = ClientRequest::default();
        let binding = f
            .manager
            .create_binding(&f.link, &client(1), &[], &request, LeaseState::Committed)
            .await
            .unwrap()
            .unwrap();
        let object = binding.objects[0].clone();
        let seen = f
            .store
            .find_ia(&client(1))
            .await
            .unwrap()
            .unwrap()
            .addresses[0]
            .clone();

        let (client_a, client_b) = (client(1), client(1));
        let (first, second) = tokio::join!(
            f.manager
                .retire(&client_a, &seen, Some(object.owner()), LeaseState::Released),
            f.manager
                .retire(&client_b, &seen, Some(object.owner()), LeaseState::Released)
        );
        assert_ne!(first.unwrap(), second.unwrap());

        let stored = f.store.find_ia(&client(1)).await.unwrap().unwrap();
        assert_eq!(stored.addresses[0].state, LeaseState::Released);
        assert!(f.link.pools(IaType::V4)[0].is_free(seen.ip));
    }

    #[tokio::test]
    async fn test_decline_never_frees_without_timeout() {
        let f = fixture(lan(vec![]), ManagerSettings::default(), PolicyResolver::default()).await;
        let request = ClientRequest::default();
        let binding = f
            .manager
            .create_binding(&f.link, &client(1), &[], &request, LeaseState::Committed)
            .await
            .unwrap()
            .unwrap();
        f.manager
            .decline_ia_address(&binding, &binding.objects[0])
            .await
            .unwrap();

        let stored = f.store.find_ia(&client(1)).await.unwrap().unwrap();
        assert_eq!(stored.addresses[0].state, LeaseState::Declined);
        assert!(stored.addresses[0].valid_end_time.is_none());
        assert_eq!(f.manager.reap_expired().await.unwrap(), 0);
        assert!(!f.link.pools(IaType::V4)[0].is_free(binding.ips()[0]));

        // The client gets a different address next time.
        let again = f
            .manager
            .find_current_binding(&f.link, &client(1), &request)
            .await
            .unwrap();
        assert!(again.is_none());
        let fresh = f
            .manager
            .create_binding(&f.link, &client(1), &[], &request, LeaseState::Committed)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(fresh.ips(), binding.ips());
    }

    #[tokio::test]
    async fn test_decline_timeout_sets_expiry() {
        let policies = PolicyResolver::new(PolicyLevel::new(
            vec![PolicyEntry::new(Policy::DeclineTimeout, PolicyValue::Number(600))],
            vec![],
            vec![],
        ));
        let f = fixture(lan(vec![]), ManagerSettings::default(), policies).await;
        let binding = f
            .manager
            .create_binding(
                &f.link,
                &client(1),
                &[],
                &ClientRequest::default(),
                LeaseState::Committed,
            )
            .await
            .unwrap()
            .unwrap();
        f.manager
            .decline_ia_address(&binding, &binding.objects[0])
            .await
            .unwrap();
        let stored = f.store.find_ia(&client(1)).await.unwrap().unwrap();
        let remaining = stored.addresses[0].valid_lifetime(Utc::now());
        assert!(remaining > 590 && remaining <= 600);
    }

    #[tokio::test]
    async fn test_init_marks_existing_leases_used() {
        let store = Arc::new(MemoryStore::new());
        let mut ia = IdentityAssoc::new(client(1), LeaseState::Committed);
        ia.addresses
            .push(IaAddressRecord::new(ip("10.0.0.10"), None, LeaseState::Committed));
        store.create_ia(&ia).await.unwrap();

        let links = Arc::new(LinkMap::new(vec![lan(vec![])]));
        let manager = BindingManager::new(
            IaType::V4,
            store,
            Arc::clone(&links),
            Arc::new(PolicyResolver::default()),
            Arc::new(NoopDdns),
            None,
            ManagerSettings::default(),
        );
        manager.init().await.unwrap();
        let pool = &links.links()[0].pools(IaType::V4)[0];
        assert!(!pool.is_free(ip("10.0.0.10")));
        assert_eq!(pool.used_count(), 1);
    }

    struct RecordingDdns(Mutex<Vec<String>>);

    impl DdnsUpdater for RecordingDdns {
        fn update(&self, request: &DdnsRequest) -> Result<()> {
            self.0.lock().unwrap().push(format!("update {} {}", request.fqdn, request.ip));
            Ok(())
        }

        fn delete(&self, request: &DdnsRequest) -> Result<()> {
            self.0.lock().unwrap().push(format!("delete {} {}", request.fqdn, request.ip));
            Err(Error::Ddns("server unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_ddns_on_commit_and_release() {
        let store = Arc::new(MemoryStore::new());
        let links = Arc::new(LinkMap::new(vec![lan(vec![])]));
        let ddns = Arc::new(RecordingDdns(Mutex::new(Vec::new())));
        let policies = PolicyResolver::new(PolicyLevel::new(
            vec![PolicyEntry::new(Policy::DdnsUpdate, PolicyValue::Flag(true))],
            vec![],
            vec![],
        ));
        let manager = BindingManager::new(
            IaType::V4,
            store,
            Arc::clone(&links),
            Arc::new(policies),
            Arc::clone(&ddns) as Arc<dyn DdnsUpdater>,
            None,
            ManagerSettings::default(),
        );
        let link = links.links()[0].clone();
        let request = ClientRequest {
            fqdn: Some("laptop.lan".to_string()),
            ..ClientRequest::default()
        };

        let binding = manager
            .create_binding(&link, &client(1), &[], &request, LeaseState::Committed)
            .await
            .unwrap()
            .unwrap();
        manager
            .release_ia_address(&binding, &binding.objects[0])
            .await
            .unwrap();

        let calls = ddns.0.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec!["update laptop.lan 10.0.0.10", "delete laptop.lan 10.0.0.10"]
        );
    }

    struct FailingStore(MemoryStore);

    impl IaStore for FailingStore {
        async fn create_ia(&self, _ia: &IdentityAssoc) -> Result<()> {
            Err(Error::Store("disk full".to_string()))
        }

        async fn update_ia(
            &self,
            _ia: &IdentityAssoc,
            _added: &[IaAddressRecord],
            _updated: &[IaAddressRecord],
            _deleted: &[IaAddressRecord],
        ) -> Result<()> {
            Err(Error::Store("disk full".to_string()))
        }

        async fn update_ia_address(&self, key: &IaKey, address: &IaAddressRecord) -> Result<()> {
            self.0.update_ia_address(key, address).await
        }

        async fn retire_ia_address(
            &self,
            key: &IaKey,
            expected: &IaAddressRecord,
            replacement: Option<&IaAddressRecord>,
        ) -> Result<bool> {
            self.0.retire_ia_address(key, expected, replacement).await
        }

        async fn delete_ia(&self, key: &IaKey) -> Result<()> {
            self.0.delete_ia(key).await
        }

        async fn find_ia(&self, key: &IaKey) -> Result<Option<IdentityAssoc>> {
            self.0.find_ia(key).await
        }

        async fn find_ia_by_address(&self, ip: IpAddr) -> Result<Option<IdentityAssoc>> {
            self.0.find_ia_by_address(ip).await
        }

        async fn find_expired_ias(
            &self,
            ia_type: IaType,
            now: DateTime<Utc>,
        ) -> Result<Vec<IdentityAssoc>> {
            self.0.find_expired_ias(ia_type, now).await
        }

        async fn find_existing_ips(&self, range: &AddressRange) -> Result<Vec<IpAddr>> {
            self.0.find_existing_ips(range).await
        }

        async fn reconcile_ia_addresses(&self, ranges: &[AddressRange]) -> Result<usize> {
            self.0.reconcile_ia_addresses(ranges).await
        }

        async fn list_ias(&self) -> Result<Vec<IdentityAssoc>> {
            self.0.list_ias().await
        }
    }

    #[tokio::test]
    async fn test_store_failure_rolls_back_allocation() {
        let links = Arc::new(LinkMap::new(vec![lan(vec![])]));
        let manager = BindingManager::new(
            IaType::V4,
            Arc::new(FailingStore(MemoryStore::new())),
            Arc::clone(&links),
            Arc::new(PolicyResolver::default()),
            Arc::new(NoopDdns),
            None,
            ManagerSettings::default(),
        );
        let link = links.links()[0].clone();

        let result = manager
            .create_binding(
                &link,
                &client(1),
                &[],
                &ClientRequest::default(),
                LeaseState::Committed,
            )
            .await;
        assert!(matches!(result, Err(Error::Store(_))));
        assert_eq!(link.pools(IaType::V4)[0].used_count(), 0);
    }
}

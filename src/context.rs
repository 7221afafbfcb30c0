//! The server context shared by message handling and the reapers.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::ddns::DdnsUpdater;
use crate::error::{Error, Result};
use crate::link::{Link, LinkMap};
use crate::manager::{BindingManager, ClientRequest, ManagerSettings};
use crate::message::ClientId;
use crate::options::DhcpOption;
use crate::policy::{Policy, PolicyLevel, PolicyResolver};
use crate::pool::ReachabilityProbe;
use crate::reaper::spawn_reaper;
use crate::store::{IaStore, IaType};

/// Everything built from configuration, created once at startup.
pub struct ServerContext<S> {
    config: Arc<Config>,
    server_id: ClientId,
    links: Arc<LinkMap>,
    policies: Arc<PolicyResolver>,
    store: Arc<S>,
    v4: Arc<BindingManager<S>>,
    na: Arc<BindingManager<S>>,
    ta: Arc<BindingManager<S>>,
    pd: Arc<BindingManager<S>>,
}

impl<S: IaStore> ServerContext<S> {
    /// Validates the configuration, drops stored leases outside every
    /// configured range and initialises the pools from the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a bad configuration, or a store
    /// error if existing leases cannot be read.
    pub async fn build(
        config: Config,
        store: Arc<S>,
        ddns: Arc<dyn DdnsUpdater>,
        probe: Option<Arc<dyn ReachabilityProbe>>,
    ) -> Result<Self> {
        config.validate()?;
        let server_id = config.server_id()?;
        let links = Arc::new(config.build_links()?);
        let policies = Arc::new(PolicyResolver::new(config.global_level()));
        let settings = ManagerSettings {
            delete_old_bindings: config.delete_old_bindings,
            store_timeout: config.store_timeout(),
        };

        let ranges = config.managed_ranges();
        let removed = tokio::time::timeout(
            settings.store_timeout,
            store.reconcile_ia_addresses(&ranges),
        )
        .await
        .map_err(|_| Error::StoreTimeout(settings.store_timeout))??;
        if removed > 0 {
            warn!("Removed {} stored leases outside the configured ranges", removed);
        }

        let manager = |ia_type| {
            Arc::new(BindingManager::new(
                ia_type,
                Arc::clone(&store),
                Arc::clone(&links),
                Arc::clone(&policies),
                Arc::clone(&ddns),
                probe.clone(),
                settings,
            ))
        };
        let (v4, na, ta, pd) = (
            manager(IaType::V4),
            manager(IaType::Na),
            manager(IaType::Ta),
            manager(IaType::Pd),
        );
        for manager in [&v4, &na, &ta, &pd] {
            manager.init().await?;
        }
        info!("Server context ready with {} links", links.links().len());

        Ok(Self {
            config: Arc::new(config),
            server_id,
            links,
            policies,
            store,
            v4,
            na,
            ta,
            pd,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server_id(&self) -> &ClientId {
        &self.server_id
    }

    pub fn server_ipv4(&self) -> Ipv4Addr {
        self.config.server_ipv4
    }

    pub fn links(&self) -> &LinkMap {
        &self.links
    }

    pub fn policies(&self) -> &PolicyResolver {
        &self.policies
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn manager(&self, ia_type: IaType) -> &Arc<BindingManager<S>> {
        match ia_type {
            IaType::V4 => &self.v4,
            IaType::Na => &self.na,
            IaType::Ta => &self.ta,
            IaType::Pd => &self.pd,
        }
    }

    /// Spawns one reaper per IA type using the configured schedule.
    pub fn start_reapers(&self) -> Vec<JoinHandle<()>> {
        let start_delay = Duration::from_secs(self.config.reaper.start_delay_secs);
        let period = Duration::from_secs(self.config.reaper.interval_secs);
        IaType::ALL
            .iter()
            .map(|ia_type| spawn_reaper(Arc::clone(self.manager(*ia_type)), start_delay, period))
            .collect()
    }

    /// Runs one expiry sweep on every manager and returns the total.
    pub async fn reap_all(&self) -> Result<usize> {
        let mut total = 0;
        for ia_type in IaType::ALL {
            total += self.manager(ia_type).reap_expired().await?;
        }
        Ok(total)
    }

    /// Options to send, resolved for the request and an optional pool or
    /// reservation level.
    pub fn reply_options(
        &self,
        request: &ClientRequest,
        pool: Option<&PolicyLevel>,
        link: &Link,
    ) -> Vec<DhcpOption> {
        self.policies
            .effective_options(&request.options, pool, Some(link.policy_level()))
    }

    /// Evaluates a switch policy at link level.
    pub fn link_flag(&self, request: &ClientRequest, link: &Link, policy: Policy) -> bool {
        self.policies
            .flag(&request.options, None, Some(link.policy_level()), policy)
    }
}

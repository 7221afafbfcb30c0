//! Periodic expiry of leases.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::manager::BindingManager;
use crate::store::IaStore;

/// Starts a task that calls [`BindingManager::reap_expired`] every `period`,
/// beginning after `start_delay`.
///
/// Ticks missed while a sweep runs long are skipped rather than bunched up.
/// The task runs until the returned handle is aborted.
pub fn spawn_reaper<S: IaStore>(
    manager: Arc<BindingManager<S>>,
    start_delay: Duration,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "{} reaper starting in {:?}, every {:?}",
            manager.ia_type(),
            start_delay,
            period
        );
        let mut interval = tokio::time::interval_at(Instant::now() + start_delay, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if let Err(e) = manager.reap_expired().await {
                error!("{} reaper failed: {}", manager.ia_type(), e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddns::NoopDdns;
    use crate::link::{Link, LinkMap};
    use crate::manager::ManagerSettings;
    use crate::message::ClientId;
    use crate::policy::{PolicyLevel, PolicyResolver};
    use crate::pool::{BindingPool, PoolKind};
    use crate::range::AddressRange;
    use crate::store::{IaAddressRecord, IaKey, IaType, IdentityAssoc, LeaseState, MemoryStore};
    use chrono::{TimeDelta, Utc};

    #[tokio::test]
    async fn test_reaper_expires_in_background() {
        let mut link = Link::new("lan", "10.0.0.0/24".parse().unwrap(), PolicyLevel::default());
        link.add_pool(
            IaType::V4,
            BindingPool::new(
                "pool",
                PoolKind::V4Address,
                AddressRange::parse("10.0.0.10-10.0.0.20").unwrap(),
                PolicyLevel::default(),
                None,
            )
            .unwrap(),
        );
        let links = Arc::new(LinkMap::new(vec![link]));

        let store = Arc::new(MemoryStore::new());
        let key = IaKey::v4(ClientId::new(vec![1, 2, 3]));
        let mut ia = IdentityAssoc::new(key.clone(), LeaseState::Committed);
        let mut record =
            IaAddressRecord::new("10.0.0.10".parse().unwrap(), None, LeaseState::Committed);
        record.valid_end_time = Some(Utc::now() - TimeDelta::seconds(30));
        ia.addresses.push(record);
        store.create_ia(&ia).await.unwrap();

        let manager = Arc::new(BindingManager::new(
            IaType::V4,
            Arc::clone(&store),
            Arc::clone(&links),
            Arc::new(PolicyResolver::default()),
            Arc::new(NoopDdns),
            None,
            ManagerSettings::default(),
        ));
        manager.init().await.unwrap();

        let handle = spawn_reaper(manager, Duration::ZERO, Duration::from_millis(20));
        for _ in 0..50 {
            if store.find_ia(&key).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        assert!(store.find_ia(&key).await.unwrap().is_none());
        let pool = &links.links()[0].pools(IaType::V4)[0];
        assert_eq!(pool.used_count(), 0);
    }
}

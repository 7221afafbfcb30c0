//! Lease store persisted to a JSON file.
//!
//! Records live in memory behind a [`RwLock`] and the whole set is written to
//! disk after every mutation. Writes are serialized by a save lock that is
//! taken before the state lock, so the file always reflects mutations in the
//! order they were applied.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::Result;
use crate::range::AddressRange;
use crate::store::{IaAddressRecord, IaKey, IaStore, IaType, IdentityAssoc, StoreState};

/// On-disk layout of the leases file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaseFile {
    #[serde(default)]
    ias: Vec<IdentityAssoc>,
}

/// File-backed [`IaStore`].
#[derive(Debug)]
pub struct JsonFileStore {
    state: RwLock<StoreState>,
    path: PathBuf,
    save_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Opens the store, loading existing records if the file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str::<LeaseFile>(&content)?
        } else {
            LeaseFile::default()
        };
        info!("Loaded {} IAs from {}", file.ias.len(), path.display());

        Ok(Self {
            state: RwLock::new(StoreState::from_ias(file.ias)),
            path,
            save_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `mutation` and writes the resulting state to disk.
    ///
    /// Nothing is written when the mutation fails.
    async fn mutate<T>(&self, mutation: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let _lock = self.save_lock.lock().await;
        let (value, snapshot) = {
            let mut state = self.state.write().await;
            let value = mutation(&mut state)?;
            (value, state.snapshot())
        };

        let content = serde_json::to_string_pretty(&LeaseFile { ias: snapshot })?;
        tokio::fs::write(&self.path, content).await?;
        debug!("Saved leases to {}", self.path.display());
        Ok(value)
    }
}

impl IaStore for JsonFileStore {
    async fn create_ia(&self, ia: &IdentityAssoc) -> Result<()> {
        self.mutate(|state| state.create(ia)).await
    }

    async fn update_ia(
        &self,
        ia: &IdentityAssoc,
        added: &[IaAddressRecord],
        updated: &[IaAddressRecord],
        deleted: &[IaAddressRecord],
    ) -> Result<()> {
        self.mutate(|state| state.update(ia, added, updated, deleted))
            .await
    }

    async fn update_ia_address(&self, key: &IaKey, address: &IaAddressRecord) -> Result<()> {
        self.mutate(|state| state.update_address(key, address)).await
    }

    async fn retire_ia_address(
        &self,
        key: &IaKey,
        expected: &IaAddressRecord,
        replacement: Option<&IaAddressRecord>,
    ) -> Result<bool> {
        self.mutate(|state| Ok(state.retire_address(key, expected, replacement)))
            .await
    }

    async fn delete_ia(&self, key: &IaKey) -> Result<()> {
        self.mutate(|state| state.delete(key)).await
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
        self.mutate(|state| Ok(state.reconcile(ranges))).await
    }

    async fn list_ias(&self) -> Result<Vec<IdentityAssoc>> {
        Ok(self.state.read().await.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ClientId;
    use crate::store::LeaseState;

    struct TestGuard(String);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn test_path(name: &str) -> (String, TestGuard) {
        let path = format!("test_store_{}.json", name);
        (path.clone(), TestGuard(path))
    }

    fn committed(last: u8, ip: &str) -> IdentityAssoc {
        let key = IaKey::v4(ClientId::new(vec![1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, last]));
        let mut ia = IdentityAssoc::new(key, LeaseState::Committed);
        ia.hostname = Some(format!("host-{last}"));
        ia.addresses.push(IaAddressRecord::new(
            ip.parse().unwrap(),
            None,
            LeaseState::Committed,
        ));
        ia
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let (path, _guard) = test_path("reopen");
        let ia = committed(1, "192.168.1.100");
        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store.create_ia(&ia).await.unwrap();
        }

        let store = JsonFileStore::open(&path).await.unwrap();
        let found = store.find_ia(&ia.key).await.unwrap().unwrap();
        assert_eq!(found.hostname.as_deref(), Some("host-1"));
        let by_ip = store
            .find_ia_by_address("192.168.1.100".parse().unwrap())
            .await
            .unwrap();
        assert!(by_ip.is_some());
    }

    #[tokio::test]
    async fn test_failed_mutation_not_written() {
        let (path, _guard) = test_path("failed");
        let store = JsonFileStore::open(&path).await.unwrap();
        assert!(store.delete_ia(&committed(1, "192.168.1.100").key).await.is_err());
        assert!(!Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_concurrent_writes_all_persisted() {
        let (path, _guard) = test_path("concurrent");
        let store = std::sync::Arc::new(JsonFileStore::open(&path).await.unwrap());

        let mut handles = vec![];
        for i in 0..10u8 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .create_ia(&committed(i, &format!("192.168.1.{}", 100 + i)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.list_ias().await.unwrap().len(), 10);
    }
}

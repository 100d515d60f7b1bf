use crate::core::{Record, Result, StoreError};
use crate::storage::{AtomicPersistentStore, DiskSpaceProbe, RecordStore, StoreConfig};
use crate::sync::{
    DualWriteCoordinator, MigratedUsers, MigrationStatus, RemoteStore, SyncPolicy, SyncTelemetry,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use tracing::info;

/// Opens the store behind one scoped key.
#[async_trait]
pub trait ScopedStoreFactory<R: Record>: Send + Sync {
    /// `user_id` is the identity the key was derived from, empty for guests.
    async fn open(&self, scoped_key: &str, user_id: &str) -> Result<Arc<dyn RecordStore<R>>>;

    /// Every scoped key that currently has data.
    async fn list_keys(&self) -> Result<Vec<String>> {
        Err(StoreError::OperationNotSupported(
            "listing scoped keys is not supported by this store".to_string(),
        ))
    }

    /// Removes all data under `scoped_key`.
    async fn purge(&self, _scoped_key: &str) -> Result<()> {
        Err(StoreError::OperationNotSupported(
            "purging scoped keys is not supported by this store".to_string(),
        ))
    }
}

/// One [`AtomicPersistentStore`] per scoped key, all in the same directory.
///
/// A key's store is shared by every handle opened for it while any of them
/// is alive, so all writers to a dataset go through one writer lock.
pub struct LocalStoreFactory<R: Record> {
    root: PathBuf,
    config: StoreConfig,
    probe: Option<Arc<dyn DiskSpaceProbe>>,
    open_stores: Arc<Mutex<HashMap<String, Weak<AtomicPersistentStore<R>>>>>,
}

impl<R: Record> Clone for LocalStoreFactory<R> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            config: self.config.clone(),
            probe: self.probe.clone(),
            open_stores: self.open_stores.clone(),
        }
    }
}

impl<R: Record> LocalStoreFactory<R> {
    pub fn new(root: impl Into<PathBuf>, config: StoreConfig) -> Self {
        Self {
            root: root.into(),
            config,
            probe: None,
            open_stores: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_disk_probe(mut self, probe: Arc<dyn DiskSpaceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// The live store for `scoped_key`, opened if no handle to it is alive.
    pub fn shared_store(&self, scoped_key: &str) -> Result<Arc<AtomicPersistentStore<R>>> {
        let mut open_stores = self.open_stores.lock()?;
        if let Some(store) = open_stores.get(scoped_key).and_then(Weak::upgrade) {
            return Ok(store);
        }

        let store = AtomicPersistentStore::open(&self.root, scoped_key, self.config.clone())?;
        let store = Arc::new(match &self.probe {
            Some(probe) => store.with_disk_probe(probe.clone()),
            None => store,
        });
        open_stores.retain(|_, weak| weak.strong_count() > 0);
        open_stores.insert(scoped_key.to_string(), Arc::downgrade(&store));
        Ok(store)
    }

    /// Main-file stems in the root directory. Backup and staging files are
    /// not keys of their own.
    fn scan_keys(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::fs("list directory", &self.root, e)),
        };

        let mut keys = BTreeSet::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let stem = stem
                .strip_suffix(".gen1")
                .or_else(|| stem.strip_suffix(".gen2"))
                .unwrap_or(stem);
            keys.insert(stem.to_string());
        }
        Ok(keys.into_iter().collect())
    }
}

#[async_trait]
impl<R: Record> ScopedStoreFactory<R> for LocalStoreFactory<R> {
    async fn open(&self, scoped_key: &str, _user_id: &str) -> Result<Arc<dyn RecordStore<R>>> {
        let factory = self.clone();
        let key = scoped_key.to_string();
        let store = tokio::task::spawn_blocking(move || factory.shared_store(&key)).await??;
        let store: Arc<dyn RecordStore<R>> = store;
        Ok(store)
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let factory = self.clone();
        tokio::task::spawn_blocking(move || factory.scan_keys()).await?
    }

    /// Destroys through the shared store so live handles drop their cache.
    async fn purge(&self, scoped_key: &str) -> Result<()> {
        let factory = self.clone();
        let key = scoped_key.to_string();
        let store = tokio::task::spawn_blocking(move || factory.shared_store(&key)).await??;
        store.destroy().await?;
        info!(key = scoped_key, "purged scoped store");
        Ok(())
    }
}

/// Local stores wrapped in a [`DualWriteCoordinator`] for the key's user.
pub struct CoordinatedStoreFactory<R: Record> {
    local: LocalStoreFactory<R>,
    remote: Arc<dyn RemoteStore<R>>,
    migration: Arc<dyn MigrationStatus>,
    policy: SyncPolicy,
    telemetry: Arc<SyncTelemetry>,
}

impl<R: Record> CoordinatedStoreFactory<R> {
    pub fn new(local: LocalStoreFactory<R>, remote: Arc<dyn RemoteStore<R>>) -> Self {
        Self {
            local,
            remote,
            migration: Arc::new(MigratedUsers::new()),
            policy: SyncPolicy::default(),
            telemetry: Arc::new(SyncTelemetry::new()),
        }
    }

    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_migration_status(mut self, migration: Arc<dyn MigrationStatus>) -> Self {
        self.migration = migration;
        self
    }

    /// Counters shared by every coordinator this factory opens.
    pub fn telemetry(&self) -> Arc<SyncTelemetry> {
        self.telemetry.clone()
    }
}

#[async_trait]
impl<R: Record> ScopedStoreFactory<R> for CoordinatedStoreFactory<R> {
    async fn open(&self, scoped_key: &str, user_id: &str) -> Result<Arc<dyn RecordStore<R>>> {
        let local = ScopedStoreFactory::<R>::open(&self.local, scoped_key, user_id).await?;
        let coordinator = DualWriteCoordinator::new(local, self.remote.clone(), user_id)
            .with_policy(self.policy.clone())
            .with_migration_status(self.migration.clone())
            .with_telemetry(self.telemetry.clone());
        let store: Arc<dyn RecordStore<R>> = Arc::new(coordinator);
        Ok(store)
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        ScopedStoreFactory::<R>::list_keys(&self.local).await
    }

    async fn purge(&self, scoped_key: &str) -> Result<()> {
        ScopedStoreFactory::<R>::purge(&self.local, scoped_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Goal;
    use crate::storage::FixedDiskSpace;
    use tempfile::TempDir;

    fn factory(dir: &TempDir) -> LocalStoreFactory<Goal> {
        LocalStoreFactory::new(dir.path(), StoreConfig::new().safety_floor_bytes(0))
            .with_disk_probe(Arc::new(FixedDiskSpace::new(u64::MAX)))
    }

    #[tokio::test]
    async fn test_list_keys_ignores_backups() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        for key in ["alice.goals", "__guest__.goals"] {
            let store = factory.open(key, "").await.unwrap();
            store.save_one(Goal::increasing("a", 1.0, 2.0)).await.unwrap();
            store.save_one(Goal::increasing("b", 1.0, 2.0)).await.unwrap();
        }

        let keys = factory.list_keys().await.unwrap();
        assert_eq!(keys, vec!["__guest__.goals".to_string(), "alice.goals".to_string()]);

        factory.purge("__guest__.goals").await.unwrap();
        let keys = factory.list_keys().await.unwrap();
        assert_eq!(keys, vec!["alice.goals".to_string()]);
    }

    #[tokio::test]
    async fn test_handles_for_one_key_share_a_store() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        let first = factory.shared_store("alice.goals").unwrap();
        let second = factory.clone().shared_store("alice.goals").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &factory.shared_store("bob.goals").unwrap()));

        first.save_one(Goal::increasing("a", 1.0, 2.0)).await.unwrap();
        assert_eq!(second.load().await.unwrap().len(), 1);

        drop(first);
        drop(second);
        let reopened = factory.shared_store("alice.goals").unwrap();
        assert_eq!(reopened.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_clears_live_handles() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        let store = factory.open("__guest__.goals", "").await.unwrap();
        store.save_one(Goal::increasing("a", 1.0, 2.0)).await.unwrap();

        factory.purge("__guest__.goals").await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }
}

use super::config::StoreConfig;
use super::engine::{DeleteOutcome, RecordEdit, RecordStore};
use super::fs_support::{DiskSpaceProbe, FileProtection, OwnerOnlyProtection, SystemDiskSpace};
use super::generations::{GenerationFiles, GenerationReport, LoadSource};
use super::validator::ContainerValidator;
use crate::core::{Container, Record, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Crash-safe store for one dataset.
///
/// All writes go through a single writer lock and the
/// [`GenerationFiles::commit`] sequence. Reads are served from an in-memory
/// copy of the last committed container; filling that copy from disk also
/// happens under the writer lock so a concurrent save cannot be overtaken by
/// a stale load.
pub struct AtomicPersistentStore<R: Record> {
    files: GenerationFiles,
    config: Arc<StoreConfig>,
    probe: Arc<dyn DiskSpaceProbe>,
    validator: Arc<ContainerValidator<R>>,
    writer: Mutex<Option<LoadSource>>,
    cache: RwLock<Option<Arc<Container<R>>>>,
}

impl<R: Record> AtomicPersistentStore<R> {
    /// Opens the dataset `stem` inside `dir`, creating the directory and
    /// removing leftovers of interrupted writes.
    pub fn open(dir: impl Into<PathBuf>, stem: &str, config: StoreConfig) -> Result<Self> {
        let files = GenerationFiles::new(dir, stem, Arc::new(OwnerOnlyProtection));
        files.ensure_dir()?;
        let swept = files.sweep_leftovers()?;
        if swept > 0 {
            info!(dir = %files.dir().display(), swept, "cleaned up after an interrupted write");
        }

        Ok(Self {
            validator: Arc::new(ContainerValidator::from_config(&config)),
            files,
            config: Arc::new(config),
            probe: Arc::new(SystemDiskSpace),
            writer: Mutex::new(None),
            cache: RwLock::new(None),
        })
    }

    pub fn with_disk_probe(mut self, probe: Arc<dyn DiskSpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_protection(mut self, protection: Arc<dyn FileProtection>) -> Self {
        self.files = GenerationFiles::new(
            self.files.dir().to_path_buf(),
            self.files.stem().to_string(),
            protection,
        );
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        self.files.dir()
    }

    pub fn files(&self) -> &GenerationFiles {
        &self.files
    }

    /// Where the most recent disk load found its data.
    pub async fn last_load_source(&self) -> Option<LoadSource> {
        *self.writer.lock().await
    }

    fn cached(&self) -> Result<Option<Arc<Container<R>>>> {
        Ok(self.cache.read()?.clone())
    }

    fn set_cache(&self, container: Option<Arc<Container<R>>>) {
        let mut guard = self.cache.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = container;
    }

    /// Loads the current container. Never fails because of unreadable files:
    /// the backup cascade ends in an empty container.
    pub async fn load_container(&self) -> Result<Arc<Container<R>>> {
        if let Some(container) = self.cached()? {
            return Ok(container);
        }

        let mut source = self.writer.lock().await;
        self.current_locked(&mut source).await
    }

    /// Caller must hold the writer lock.
    async fn current_locked(&self, source: &mut Option<LoadSource>) -> Result<Arc<Container<R>>> {
        if let Some(container) = self.cached()? {
            return Ok(container);
        }

        let files = self.files.clone();
        let schema_version = self.config.schema_version.clone();
        let (container, loaded_from) =
            tokio::task::spawn_blocking(move || files.load_cascading::<R>(&schema_version)).await?;

        debug!(
            dir = %self.files.dir().display(),
            source = ?loaded_from,
            records = container.len(),
            "container loaded"
        );
        *source = Some(loaded_from);
        let container = Arc::new(container);
        self.set_cache(Some(container.clone()));
        Ok(container)
    }

    /// Caller must hold the writer lock.
    async fn commit_locked(&self, container: Container<R>) -> Result<Arc<Container<R>>> {
        let files = self.files.clone();
        let config = self.config.clone();
        let probe = self.probe.clone();
        let validator = self.validator.clone();

        let committed = tokio::task::spawn_blocking(move || {
            files.commit(&container, &config, probe.as_ref(), &validator)
        })
        .await?;

        match committed {
            Ok(container) => {
                let container = Arc::new(container);
                self.set_cache(Some(container.clone()));
                Ok(container)
            }
            Err(err) => {
                self.set_cache(None);
                Err(err)
            }
        }
    }

    /// Persists `container` as the complete new state.
    pub async fn save_container(&self, container: Container<R>) -> Result<Arc<Container<R>>> {
        let _guard = self.writer.lock().await;
        self.commit_locked(container).await
    }

    /// Read-modify-write under the writer lock. Returning `None` from `f`
    /// skips the write.
    pub async fn update<F>(&self, f: F) -> Result<Option<Arc<Container<R>>>>
    where
        F: FnOnce(Container<R>) -> Option<Container<R>> + Send,
    {
        let mut source = self.writer.lock().await;
        let current = self.current_locked(&mut source).await?;
        match f(current.as_ref().clone()) {
            Some(next) => self.commit_locked(next).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn mark_migration_step(&self, step: &str) -> Result<()> {
        let step = step.to_string();
        self.update(move |container| {
            if container.has_completed_step(&step) {
                None
            } else {
                Some(container.complete_migration_step(step))
            }
        })
        .await?;
        Ok(())
    }

    pub async fn has_completed_migration_step(&self, step: &str) -> Result<bool> {
        Ok(self.load_container().await?.has_completed_step(step))
    }

    /// Reports on every generation file without touching the cache.
    pub async fn inspect(&self) -> Result<Vec<GenerationReport>> {
        let _guard = self.writer.lock().await;
        let files = self.files.clone();
        Ok(tokio::task::spawn_blocking(move || files.inspect::<R>()).await?)
    }

    /// Deletes the dataset's files.
    pub async fn destroy(&self) -> Result<()> {
        let _guard = self.writer.lock().await;
        self.set_cache(None);
        let files = self.files.clone();
        tokio::task::spawn_blocking(move || files.remove_all()).await?
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for AtomicPersistentStore<R> {
    async fn load(&self) -> Result<Vec<R>> {
        Ok(self.load_container().await?.records.clone())
    }

    async fn save_all(&self, records: Vec<R>) -> Result<()> {
        self.update(move |container| Some(container.with_records(records)))
            .await?;
        Ok(())
    }

    async fn save_one(&self, record: R) -> Result<()> {
        self.update(move |container| Some(container.upsert(record)))
            .await?;
        Ok(())
    }

    async fn delete_one(&self, id: Uuid) -> Result<DeleteOutcome> {
        let written = self
            .update(move |container| {
                let (next, removed) = container.remove(id);
                removed.then_some(next)
            })
            .await?;
        Ok(match written {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn clear_all(&self) -> Result<()> {
        self.update(|container| Some(container.with_records(Vec::new())))
            .await?;
        Ok(())
    }

    async fn edit_records(&self, edit: RecordEdit<R>) -> Result<Vec<R>> {
        let mut source = self.writer.lock().await;
        let current = self.current_locked(&mut source).await?;
        let mut records = current.records.clone();
        if !edit(&mut records) {
            return Ok(current.records.clone());
        }
        let next = current.as_ref().clone().with_records(records);
        Ok(self.commit_locked(next).await?.records.clone())
    }

    fn invalidate_cache(&self) {
        self.set_cache(None);
    }
}

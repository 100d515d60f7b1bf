//! Hot/historical split for datasets where history dominates size.
//!
//! Current records live in a size-capped hot partition written through the
//! full atomic commit sequence. Per-day values live in one small file per
//! `(record, month)`; losing one of those costs at most one month of one
//! record, so they are written atomically but without backup rotation.

use super::config::{MB, SegmentConfig};
use super::engine::{DeleteOutcome, RecordEdit, RecordStore};
use super::fs_support::{
    DiskSpaceProbe, FileProtection, OwnerOnlyProtection, SystemDiskSpace, TEMP_SUFFIX,
    atomic_replace,
};
use super::generations::GenerationFiles;
use super::validator::ContainerValidator;
use crate::core::{Container, Record, Result, StoreError};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const HOT_PARTITION_STEM: &str = "hot";
const HISTORY_DIR: &str = "history";

/// Calendar month used to key historical partitions. Formats as `yyyy-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn minus_months(self, months: u32) -> Self {
        let index = self.year as i64 * 12 + (self.month as i64 - 1) - months as i64;
        Self {
            year: index.div_euclid(12) as i32,
            month: index.rem_euclid(12) as u32 + 1,
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| format!("Invalid month '{}'. Expected format: yyyy-MM", s))?;
        let year = year.parse::<i32>().map_err(|e| format!("Invalid year in '{}': {}", s, e))?;
        let month = month.parse::<u32>().map_err(|e| format!("Invalid month in '{}': {}", s, e))?;
        Self::new(year, month).ok_or_else(|| format!("Month out of range in '{}'", s))
    }
}

/// Contents of one `{recordId}_{yyyy-MM}` partition file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPartition {
    pub record_id: Uuid,
    pub month: String,
    pub values: BTreeMap<NaiveDate, f64>,
}

/// Plain-data handle for history file operations run on the blocking pool.
#[derive(Clone)]
struct HistoryFiles {
    dir: PathBuf,
    protection: Arc<dyn FileProtection>,
}

impl HistoryFiles {
    fn path(&self, record_id: Uuid, month: YearMonth) -> PathBuf {
        self.dir.join(format!("{}_{}.json", record_id, month))
    }

    fn parse_name(name: &str) -> Option<(Uuid, YearMonth)> {
        let stem = name.strip_suffix(".json")?;
        let (id, month) = stem.split_once('_')?;
        Some((Uuid::parse_str(id).ok()?, month.parse().ok()?))
    }

    /// Missing partitions read as empty.
    fn read(&self, record_id: Uuid, month: YearMonth) -> Result<BTreeMap<NaiveDate, f64>> {
        let path = self.path(record_id, month);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(StoreError::fs("read", &path, e)),
        };
        let partition: HistoryPartition =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Decoding {
                path: path.clone(),
                message: e.to_string(),
            })?;
        Ok(partition.values)
    }

    fn write(
        &self,
        record_id: Uuid,
        month: YearMonth,
        values: BTreeMap<NaiveDate, f64>,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| StoreError::fs("create directory", &self.dir, e))?;
        let partition = HistoryPartition {
            record_id,
            month: month.to_string(),
            values,
        };
        let bytes = serde_json::to_vec(&partition)
            .map_err(|e| {
                StoreError::Encoding(format!("Failed to serialize history partition: {}", e))
            })?;
        atomic_replace(self.protection.as_ref(), &self.path(record_id, month), &bytes)
    }

    fn list(&self) -> Result<Vec<(Uuid, YearMonth, PathBuf)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::fs("list directory", &self.dir, e)),
        };
        let mut partitions = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            if let Some((id, month)) = Self::parse_name(&name) {
                partitions.push((id, month, entry.path()));
            }
        }
        partitions.sort_by_key(|(id, month, _)| (*id, *month));
        Ok(partitions)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::fs("remove", path, e)),
        }
    }
}

pub struct SegmentedStore<R: Record> {
    hot: GenerationFiles,
    history: HistoryFiles,
    config: Arc<SegmentConfig>,
    probe: Arc<dyn DiskSpaceProbe>,
    validator: Arc<ContainerValidator<R>>,
    writer: Mutex<()>,
    cache: RwLock<Option<Arc<Container<R>>>>,
}

impl<R: Record> SegmentedStore<R> {
    pub fn open(dir: impl Into<PathBuf>, config: SegmentConfig) -> Result<Self> {
        let dir = dir.into();
        let protection: Arc<dyn FileProtection> = Arc::new(OwnerOnlyProtection);
        let hot = GenerationFiles::new(&dir, HOT_PARTITION_STEM, protection.clone());
        hot.ensure_dir()?;
        hot.sweep_leftovers()?;

        Ok(Self {
            validator: Arc::new(ContainerValidator::from_config(&config.store)),
            hot,
            history: HistoryFiles {
                dir: dir.join(HISTORY_DIR),
                protection,
            },
            config: Arc::new(config),
            probe: Arc::new(SystemDiskSpace),
            writer: Mutex::new(()),
            cache: RwLock::new(None),
        })
    }

    pub fn with_disk_probe(mut self, probe: Arc<dyn DiskSpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    fn cached(&self) -> Result<Option<Arc<Container<R>>>> {
        Ok(self.cache.read()?.clone())
    }

    fn set_cache(&self, container: Option<Arc<Container<R>>>) {
        let mut guard = self.cache.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = container;
    }

    pub async fn load_hot(&self) -> Result<Arc<Container<R>>> {
        if let Some(container) = self.cached()? {
            return Ok(container);
        }
        let _guard = self.writer.lock().await;
        self.hot_locked().await
    }

    /// Caller must hold the writer lock.
    async fn hot_locked(&self) -> Result<Arc<Container<R>>> {
        if let Some(container) = self.cached()? {
            return Ok(container);
        }
        let files = self.hot.clone();
        let schema_version = self.config.store.schema_version.clone();
        let (container, _) =
            tokio::task::spawn_blocking(move || files.load_cascading::<R>(&schema_version)).await?;
        let container = Arc::new(container);
        self.set_cache(Some(container.clone()));
        Ok(container)
    }

    fn check_hot_cap(&self, container: &Container<R>) -> Result<()> {
        let size = container.to_bytes()?.len() as u64;
        let limit = self.config.hot_cap_bytes;
        if size > limit {
            return Err(StoreError::SizeExceeded {
                size,
                limit,
                remediation: format!(
                    "archive older records into history partitions or migrate to a larger-capacity engine (hot partition holds {} of {} MB)",
                    container.len(),
                    limit / MB
                ),
            });
        }
        Ok(())
    }

    /// Caller must hold the writer lock.
    async fn commit_hot_locked(&self, container: Container<R>) -> Result<Arc<Container<R>>> {
        self.check_hot_cap(&container)?;

        let files = self.hot.clone();
        let config = self.config.clone();
        let probe = self.probe.clone();
        let validator = self.validator.clone();
        let committed = tokio::task::spawn_blocking(move || {
            files.commit(&container, &config.store, probe.as_ref(), &validator)
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

    async fn update_hot<F>(&self, f: F) -> Result<Option<Arc<Container<R>>>>
    where
        F: FnOnce(Container<R>) -> Option<Container<R>> + Send,
    {
        let _guard = self.writer.lock().await;
        let current = self.hot_locked().await?;
        match f(current.as_ref().clone()) {
            Some(next) => self.commit_hot_locked(next).await.map(Some),
            None => Ok(None),
        }
    }

    /// Records one per-day value, replacing any earlier value for that day.
    pub async fn record_value(&self, record_id: Uuid, date: NaiveDate, value: f64) -> Result<()> {
        self.record_values(record_id, BTreeMap::from([(date, value)])).await
    }

    /// Merges per-day values into their monthly partitions.
    pub async fn record_values(
        &self,
        record_id: Uuid,
        values: BTreeMap<NaiveDate, f64>,
    ) -> Result<()> {
        let mut by_month: BTreeMap<YearMonth, BTreeMap<NaiveDate, f64>> = BTreeMap::new();
        for (date, value) in values {
            by_month.entry(YearMonth::of(date)).or_default().insert(date, value);
        }

        let _guard = self.writer.lock().await;
        let history = self.history.clone();
        tokio::task::spawn_blocking(move || {
            for (month, incoming) in by_month {
                let mut current = history.read(record_id, month)?;
                current.extend(incoming);
                history.write(record_id, month, current)?;
            }
            Ok::<_, StoreError>(())
        })
        .await?
    }

    /// Values for `record_id` between `from` and `to` inclusive. Months with
    /// no partition contribute nothing.
    pub async fn history_range(
        &self,
        record_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<BTreeMap<NaiveDate, f64>> {
        if from > to {
            return Ok(BTreeMap::new());
        }
        let _guard = self.writer.lock().await;
        let history = self.history.clone();
        tokio::task::spawn_blocking(move || {
            let mut merged = BTreeMap::new();
            let last = YearMonth::of(to);
            let mut month = YearMonth::of(from);
            while month <= last {
                merged.extend(history.read(record_id, month)?);
                month = month.next();
            }
            merged.retain(|date, _| *date >= from && *date <= to);
            Ok::<_, StoreError>(merged)
        })
        .await?
    }

    /// Months that have a partition for `record_id`, oldest first.
    pub async fn history_months(&self, record_id: Uuid) -> Result<Vec<YearMonth>> {
        let _guard = self.writer.lock().await;
        let history = self.history.clone();
        let partitions = tokio::task::spawn_blocking(move || history.list()).await??;
        Ok(partitions
            .into_iter()
            .filter(|(id, _, _)| *id == record_id)
            .map(|(_, month, _)| month)
            .collect())
    }

    /// Removes every partition older than `cutoff`. Returns how many were
    /// removed.
    pub async fn purge_history_before(&self, cutoff: YearMonth) -> Result<usize> {
        let _guard = self.writer.lock().await;
        let history = self.history.clone();
        let removed = tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            for (_, month, path) in history.list()? {
                if month < cutoff {
                    history.remove(&path)?;
                    removed += 1;
                }
            }
            Ok::<_, StoreError>(removed)
        })
        .await??;
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "purged expired history partitions");
        }
        Ok(removed)
    }

    /// Applies the configured retention window relative to `today`. Without a
    /// retention window nothing is purged.
    pub async fn purge_expired_history(&self, today: NaiveDate) -> Result<usize> {
        match self.config.retention_months {
            Some(months) => {
                self.purge_history_before(YearMonth::of(today).minus_months(months))
                    .await
            }
            None => {
                debug!("no history retention configured, skipping purge");
                Ok(0)
            }
        }
    }

    async fn remove_history_of(&self, record_id: Uuid) -> Result<usize> {
        let history = self.history.clone();
        tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            for (id, _, path) in history.list()? {
                if id == record_id {
                    history.remove(&path)?;
                    removed += 1;
                }
            }
            Ok::<_, StoreError>(removed)
        })
        .await?
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for SegmentedStore<R> {
    async fn load(&self) -> Result<Vec<R>> {
        Ok(self.load_hot().await?.records.clone())
    }

    async fn save_all(&self, records: Vec<R>) -> Result<()> {
        self.update_hot(move |container| Some(container.with_records(records)))
            .await?;
        Ok(())
    }

    async fn save_one(&self, record: R) -> Result<()> {
        self.update_hot(move |container| Some(container.upsert(record)))
            .await?;
        Ok(())
    }

    /// Removes the hot record, then its history. History removal failures are
    /// logged and do not undo the delete.
    async fn delete_one(&self, id: Uuid) -> Result<DeleteOutcome> {
        let written = self
            .update_hot(move |container| {
                let (next, removed) = container.remove(id);
                removed.then_some(next)
            })
            .await?;

        let _guard = self.writer.lock().await;
        match self.remove_history_of(id).await {
            Ok(0) => {}
            Ok(removed) => debug!(record_id = %id, removed, "removed history partitions"),
            Err(err) => warn!(record_id = %id, error = %err, "failed to remove history partitions"),
        }

        Ok(match written {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn clear_all(&self) -> Result<()> {
        self.update_hot(|container| Some(container.with_records(Vec::new())))
            .await?;
        Ok(())
    }

    async fn edit_records(&self, edit: RecordEdit<R>) -> Result<Vec<R>> {
        let _guard = self.writer.lock().await;
        let current = self.hot_locked().await?;
        let mut records = current.records.clone();
        if !edit(&mut records) {
            return Ok(current.records.clone());
        }
        let next = current.as_ref().clone().with_records(records);
        Ok(self.commit_hot_locked(next).await?.records.clone())
    }

    fn invalidate_cache(&self) {
        self.set_cache(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Goal;
    use crate::storage::StoreConfig;
    use crate::storage::fs_support::FixedDiskSpace;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn open(dir: &TempDir, config: SegmentConfig) -> SegmentedStore<Goal> {
        let config = config.store(StoreConfig::new().safety_floor_bytes(0));
        SegmentedStore::open(dir.path(), config)
            .unwrap()
            .with_disk_probe(Arc::new(FixedDiskSpace::new(u64::MAX)))
    }

    #[test]
    fn test_year_month_arithmetic() {
        let jan = YearMonth::new(2024, 1).unwrap();
        assert_eq!(jan.minus_months(1), YearMonth::new(2023, 12).unwrap());
        assert_eq!(jan.minus_months(13), YearMonth::new(2022, 12).unwrap());
        assert_eq!(YearMonth::new(2023, 12).unwrap().next(), jan);
        assert_eq!(jan.to_string(), "2024-01");
        assert_eq!("2024-01".parse::<YearMonth>().unwrap(), jan);
        assert!("2024-13".parse::<YearMonth>().is_err());
        assert!(YearMonth::new(2024, 0).is_none());
    }

    #[tokio::test]
    async fn test_hot_partition_over_cap_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, SegmentConfig::new().hot_cap_bytes(1_000));
        store.save_one(Goal::increasing("small", 1.0, 2.0)).await.unwrap();

        let many: Vec<Goal> = (0..20)
            .map(|i| Goal::increasing(format!("goal {i}"), 1.0, 2.0))
            .collect();
        let err = store.save_all(many).await.unwrap_err();
        match err {
            StoreError::SizeExceeded { limit, remediation, .. } => {
                assert_eq!(limit, 1_000);
                assert!(remediation.contains("archive older records"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_history_range_spans_months_and_tolerates_gaps() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, SegmentConfig::new());
        let id = Uuid::new_v4();

        store.record_value(id, date(2024, 1, 30), 1.0).await.unwrap();
        store.record_value(id, date(2024, 1, 31), 2.0).await.unwrap();
        store.record_value(id, date(2024, 3, 1), 3.0).await.unwrap();
        store.record_value(id, date(2024, 1, 31), 5.0).await.unwrap();

        let range = store.history_range(id, date(2024, 1, 31), date(2024, 3, 31)).await.unwrap();
        assert_eq!(
            range,
            BTreeMap::from([(date(2024, 1, 31), 5.0), (date(2024, 3, 1), 3.0)])
        );
        assert!(dir.path().join("history").join(format!("{id}_2024-01.json")).exists());
        assert!(!dir.path().join("history").join(format!("{id}_2024-02.json")).exists());

        let other = store
            .history_range(Uuid::new_v4(), date(2024, 1, 1), date(2024, 12, 31))
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_purge_respects_retention() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, SegmentConfig::new().retention_months(2));
        let id = Uuid::new_v4();
        store
            .record_values(
                id,
                BTreeMap::from([
                    (date(2024, 1, 5), 1.0),
                    (date(2024, 2, 5), 1.0),
                    (date(2024, 3, 5), 1.0),
                    (date(2024, 4, 5), 1.0),
                ]),
            )
            .await
            .unwrap();

        let removed = store.purge_expired_history(date(2024, 4, 20)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            store.history_months(id).await.unwrap(),
            vec![
                YearMonth::new(2024, 2).unwrap(),
                YearMonth::new(2024, 3).unwrap(),
                YearMonth::new(2024, 4).unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_removes_record_history() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, SegmentConfig::new());
        let goal = Goal::decreasing("sugar", 10.0, 2.0);
        store.save_one(goal.clone()).await.unwrap();
        store.record_value(goal.id, date(2024, 5, 1), 7.0).await.unwrap();

        assert_eq!(store.delete_one(goal.id).await.unwrap(), DeleteOutcome::Deleted);
        assert!(store.history_months(goal.id).await.unwrap().is_empty());
        assert!(store.load().await.unwrap().is_empty());
    }
}

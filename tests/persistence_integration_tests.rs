//! Integration tests for atomic persistence, backup rotation and crash recovery

use dualstore::storage::{
    FileProtection, FixedDiskSpace, Generation, LoadSource, OwnerOnlyProtection,
};
use dualstore::{
    AtomicPersistentStore, Container, DiskSpaceError, Goal, IntegrityError, RecordStore,
    StoreConfig, StoreError,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;

const STEM: &str = "goals";

fn config() -> StoreConfig {
    StoreConfig::new().safety_floor_bytes(0)
}

fn open(dir: &Path) -> AtomicPersistentStore<Goal> {
    AtomicPersistentStore::open(dir, STEM, config())
        .unwrap()
        .with_disk_probe(Arc::new(FixedDiskSpace::new(u64::MAX)))
}

fn path(dir: &Path, generation: Generation) -> PathBuf {
    match generation {
        Generation::Main => dir.join("goals.json"),
        Generation::Gen1 => dir.join("goals.gen1.json"),
        Generation::Gen2 => dir.join("goals.gen2.json"),
    }
}

fn snapshot_files(dir: &Path) -> Vec<Option<Vec<u8>>> {
    Generation::ALL
        .into_iter()
        .map(|generation| fs::read(path(dir, generation)).ok())
        .collect()
}

fn leftover_temp_files(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp") || name.ends_with(".new"))
        .collect()
}

fn titles(records: &[Goal]) -> Vec<String> {
    records.iter().map(|goal| goal.title.clone()).collect()
}

/// Two saves: `main` and `gen1` hold B, `gen2` holds A.
async fn write_two_generations(dir: &Path) -> (Goal, Goal) {
    let store = open(dir);
    let a = Goal::decreasing("A", 10.0, 5.0);
    let b = Goal::decreasing("B", 8.0, 2.0);
    store.save_all(vec![a.clone()]).await.unwrap();
    store.save_all(vec![b.clone()]).await.unwrap();
    (a, b)
}

#[tokio::test]
async fn test_round_trip_is_field_for_field_identical() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path());
    let goal = Goal::decreasing("Cut sugar", 12.5, 3.25).with_notes("grams per day, ünïcödé ✓");
    let saved = store
        .save_container(
            Container::empty("1.0.0")
                .with_records(vec![goal.clone()])
                .complete_migration_step("seed"),
        )
        .await
        .unwrap();

    let reopened = open(dir.path());
    let loaded = reopened.load_container().await.unwrap();
    assert_eq!(*loaded, *saved);
    assert_eq!(loaded.records, vec![goal]);

    let bytes = fs::read(path(dir.path(), Generation::Main)).unwrap();
    let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(raw["schemaVersion"], "1.0.0");
    assert!(raw["lastUpdated"].is_string());
    assert_eq!(raw["completedMigrationSteps"][0], "seed");
}

#[tokio::test]
async fn test_rotation_keeps_two_consistent_generations() {
    let dir = TempDir::new().unwrap();
    write_two_generations(dir.path()).await;

    let files = open(dir.path()).inspect().await.unwrap();
    assert!(files.iter().all(|report| report.is_healthy()));
    assert_eq!(files[0].record_count, Some(1));

    let main = fs::read(path(dir.path(), Generation::Main)).unwrap();
    let gen1 = fs::read(path(dir.path(), Generation::Gen1)).unwrap();
    assert_eq!(main, gen1);
    assert!(leftover_temp_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_cascading_recovery() {
    let dir = TempDir::new().unwrap();
    let (a, b) = write_two_generations(dir.path()).await;

    fs::write(path(dir.path(), Generation::Main), b"{ truncated").unwrap();
    let store = open(dir.path());
    assert_eq!(titles(&store.load().await.unwrap()), vec![b.title.clone()]);
    assert_eq!(store.last_load_source().await, Some(LoadSource::Generation(Generation::Gen1)));
    // main was repaired from gen1
    let repaired: Container<Goal> = Container::from_bytes(
        &path(dir.path(), Generation::Main),
        &fs::read(path(dir.path(), Generation::Main)).unwrap(),
    )
    .unwrap();
    assert_eq!(repaired.records[0].id, b.id);

    fs::write(path(dir.path(), Generation::Main), b"garbage").unwrap();
    fs::write(path(dir.path(), Generation::Gen1), b"").unwrap();
    let store = open(dir.path());
    assert_eq!(titles(&store.load().await.unwrap()), vec![a.title.clone()]);
    assert_eq!(store.last_load_source().await, Some(LoadSource::Generation(Generation::Gen2)));

    fs::write(path(dir.path(), Generation::Main), b"garbage").unwrap();
    fs::write(path(dir.path(), Generation::Gen1), b"garbage").unwrap();
    fs::write(path(dir.path(), Generation::Gen2), b"garbage").unwrap();
    let store = open(dir.path());
    assert!(store.load().await.unwrap().is_empty());
    assert_eq!(store.last_load_source().await, Some(LoadSource::Empty));
}

#[tokio::test]
async fn test_duplicate_ids_leave_committed_state_unchanged() {
    let dir = TempDir::new().unwrap();
    write_two_generations(dir.path()).await;
    let before = snapshot_files(dir.path());

    let store = open(dir.path());
    let dup = Goal::increasing("dup", 1.0, 2.0);
    let err = store
        .save_all(vec![dup.clone(), dup.clone().with_notes("again")])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Integrity(IntegrityError::DuplicateIds(ref ids)) if ids == &vec![dup.id]
    ));

    assert_eq!(snapshot_files(dir.path()), before);
    assert_eq!(titles(&store.load().await.unwrap()), vec!["B".to_string()]);
}

#[tokio::test]
async fn test_disk_space_guard_touches_nothing() {
    let dir = TempDir::new().unwrap();
    write_two_generations(dir.path()).await;
    let before = snapshot_files(dir.path());

    let disk = Arc::new(FixedDiskSpace::new(10));
    let store = AtomicPersistentStore::<Goal>::open(dir.path(), STEM, config())
        .unwrap()
        .with_disk_probe(disk.clone());
    let err = store
        .save_one(Goal::increasing("new", 1.0, 2.0))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DiskSpace(DiskSpaceError::Insufficient { .. })));
    assert!(err.to_string().contains("free up storage"));

    assert_eq!(snapshot_files(dir.path()), before);
    assert!(leftover_temp_files(dir.path()).is_empty());

    // Enough for the write but not for the safety buffer
    disk.set(2_000);
    let config = StoreConfig::new().safety_floor_bytes(1_000_000);
    let floor = AtomicPersistentStore::<Goal>::open(dir.path(), STEM, config)
        .unwrap()
        .with_disk_probe(disk);
    let err = floor.save_one(Goal::increasing("new", 1.0, 2.0)).await.unwrap_err();
    assert!(matches!(err, StoreError::DiskSpace(DiskSpaceError::Low { .. })));
    assert_eq!(snapshot_files(dir.path()), before);
}

/// Protection that starts failing on demand, interrupting a save before the
/// rename.
#[derive(Default)]
struct FlakyProtection {
    failing: AtomicBool,
}

impl FileProtection for FlakyProtection {
    fn protect(&self, path: &Path) -> std::io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("protection unavailable"));
        }
        OwnerOnlyProtection.protect(path)
    }

    fn exclude_from_backup(&self, path: &Path) -> std::io::Result<()> {
        OwnerOnlyProtection.exclude_from_backup(path)
    }
}

#[tokio::test]
async fn test_interruption_before_rename_keeps_main() {
    let dir = TempDir::new().unwrap();
    let protection = Arc::new(FlakyProtection::default());
    let store = open(dir.path()).with_protection(protection.clone());
    store.save_one(Goal::increasing("kept", 1.0, 2.0)).await.unwrap();
    let before = snapshot_files(dir.path());

    protection.failing.store(true, Ordering::SeqCst);
    let err = store
        .save_one(Goal::increasing("lost", 1.0, 2.0))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Filesystem { .. }));

    assert_eq!(snapshot_files(dir.path()), before);
    assert!(leftover_temp_files(dir.path()).is_empty());
    assert_eq!(titles(&open(dir.path()).load().await.unwrap()), vec!["kept".to_string()]);
}

#[tokio::test]
async fn test_interruption_after_rename_before_rotation() {
    let dir = TempDir::new().unwrap();
    let (_, b) = write_two_generations(dir.path()).await;

    // main holds the newest container, a staged backup was never moved into gen1
    let c = Goal::increasing("C", 1.0, 2.0);
    let newest = Container::empty("1.0.0").with_records(vec![c.clone()]);
    fs::write(path(dir.path(), Generation::Main), newest.to_bytes().unwrap()).unwrap();
    fs::write(dir.path().join("goals.gen1.json.new"), b"{ half").unwrap();
    fs::write(dir.path().join(".goals.json.x1y2.tmp"), b"partial").unwrap();

    let store = open(dir.path());
    assert!(leftover_temp_files(dir.path()).is_empty());
    assert_eq!(store.load().await.unwrap(), vec![c]);

    let gen1: Container<Goal> = Container::from_bytes(
        &path(dir.path(), Generation::Gen1),
        &fs::read(path(dir.path(), Generation::Gen1)).unwrap(),
    )
    .unwrap();
    assert_eq!(gen1.records[0].id, b.id);
}

#[tokio::test]
async fn test_in_place_mode_still_rotates() {
    let dir = TempDir::new().unwrap();
    let store = AtomicPersistentStore::<Goal>::open(dir.path(), STEM, config().atomic_writes(false))
        .unwrap()
        .with_disk_probe(Arc::new(FixedDiskSpace::new(u64::MAX)));
    store.save_one(Goal::increasing("a", 1.0, 2.0)).await.unwrap();
    store.save_one(Goal::increasing("b", 1.0, 2.0)).await.unwrap();

    assert!(path(dir.path(), Generation::Gen2).exists());
    assert_eq!(open(dir.path()).load().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_concurrent_saves_are_serialized() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open(dir.path()));

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .save_one(Goal::increasing(format!("goal {i}"), 1.0, 2.0))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(store.load().await.unwrap().len(), 8);
    assert_eq!(open(dir.path()).load().await.unwrap().len(), 8);
}

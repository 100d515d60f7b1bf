//! Local-first dual writes with background replication.
//!
//! Every mutation completes against the local store before the caller sees a
//! result. Replication to the remote store runs in detached tasks that report
//! only through the records' persisted [`SyncState`] and [`SyncTelemetry`].
//!
//! Passes of one coordinator run one at a time and read the records they
//! upload from the local store when they start, so a pass never sends
//! content older than what was stored when it began. A pass only marks a
//! record `synced` if its content is still the one that was uploaded.

use super::policy::{ReadPolicy, SyncPolicy};
use super::remote::{MigratedUsers, MigrationStatus, RemoteStore};
use super::status::{SyncStatusTracker, same_content};
use super::telemetry::{OperationKind, SyncTelemetry, TelemetrySnapshot, WriteTarget};
use crate::core::{Record, Result, SyncState};
use crate::storage::{DeleteOutcome, RecordEdit, RecordStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Ids owned by passes that have not finished yet.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashMap<Uuid, usize>>>);

impl InFlight {
    fn claim(&self, ids: &[Uuid]) -> InFlightClaim {
        let mut owned = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for id in ids {
            *owned.entry(*id).or_insert(0) += 1;
        }
        InFlightClaim {
            owner: self.clone(),
            ids: ids.to_vec(),
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        let owned = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        owned.contains_key(id)
    }
}

struct InFlightClaim {
    owner: InFlight,
    ids: Vec<Uuid>,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        let mut owned = self.owner.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for id in &self.ids {
            if let Some(count) = owned.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    owned.remove(id);
                }
            }
        }
    }
}

/// Owned state of one background sync pass.
struct SyncPass<R: Record> {
    local: Arc<dyn RecordStore<R>>,
    remote: Arc<dyn RemoteStore<R>>,
    user_id: String,
    tracker: SyncStatusTracker,
    telemetry: Arc<SyncTelemetry>,
    turn: Arc<tokio::sync::Mutex<()>>,
}

impl<R: Record> SyncPass<R> {
    async fn run(self, ids: Vec<Uuid>, _claim: InFlightClaim) {
        let _turn = self.turn.lock().await;
        let due = self.claim_due(&ids).await;
        if due.is_empty() {
            debug!(user_id = %self.user_id, "nothing due within the skip window");
            return;
        }

        let mut settled = Vec::with_capacity(due.len());
        for record in due {
            let id = record.id();
            let mut outgoing = record.clone();
            *outgoing.sync_state_mut() = SyncStatusTracker::synced(Utc::now());

            self.telemetry.record_sync_attempt();
            let state = match self.remote.upsert(&self.user_id, outgoing).await {
                Ok(()) => {
                    self.telemetry
                        .record(WriteTarget::Secondary, OperationKind::Save, true);
                    SyncStatusTracker::synced(Utc::now())
                }
                Err(err) => {
                    self.telemetry
                        .record(WriteTarget::Secondary, OperationKind::Save, false);
                    warn!(record_id = %id, error = %err, "remote upsert failed");
                    SyncStatusTracker::failed(record.sync_state())
                }
            };
            settled.push((record, state));
        }

        self.settle(settled).await;
    }

    /// Moves the due records among `ids` to `syncing` and returns them as
    /// stored. Records deleted since the pass was scheduled are not returned.
    async fn claim_due(&self, ids: &[Uuid]) -> Vec<R> {
        let wanted: HashSet<Uuid> = ids.iter().copied().collect();
        let tracker = self.tracker;
        let now = Utc::now();

        let targets = wanted.clone();
        let claimed = self
            .local
            .edit_records(Box::new(move |records: &mut Vec<R>| {
                let mut changed = false;
                for record in records.iter_mut().filter(|r| targets.contains(&r.id())) {
                    if tracker.needs_sync(&*record, now) {
                        let syncing = SyncStatusTracker::syncing(record.sync_state());
                        if *record.sync_state() != syncing {
                            *record.sync_state_mut() = syncing;
                            changed = true;
                        }
                    }
                }
                changed
            }))
            .await;

        let records = match claimed {
            Ok(records) => records,
            Err(err) => {
                warn!(user_id = %self.user_id, error = %err, "failed to mark records as syncing");
                match self.local.load().await {
                    Ok(records) => records,
                    Err(err) => {
                        error!(user_id = %self.user_id, error = %err, "failed to read records to sync");
                        return Vec::new();
                    }
                }
            }
        };
        records
            .into_iter()
            .filter(|record| wanted.contains(&record.id()) && tracker.needs_sync(record, now))
            .collect()
    }

    /// Persists upload results for records whose content is still the one
    /// that was sent. A record deleted locally while its upsert was in flight
    /// is deleted remotely again.
    async fn settle(&self, settled: Vec<(R, SyncState)>) {
        let uploaded: Vec<Uuid> = settled
            .iter()
            .filter(|(_, state)| state.is_synced())
            .map(|(record, _)| record.id())
            .collect();

        let written = self
            .local
            .edit_records(Box::new(move |records: &mut Vec<R>| {
                let mut changed = false;
                for (sent, state) in settled {
                    let current = records.iter_mut().find(|r| r.id() == sent.id());
                    if let Some(current) = current {
                        if same_content(&*current, &sent) && *current.sync_state() != state {
                            *current.sync_state_mut() = state;
                            changed = true;
                        }
                    }
                }
                changed
            }))
            .await;

        let records = match written {
            Ok(records) => records,
            Err(err) => {
                error!(user_id = %self.user_id, error = %err, "failed to persist sync results");
                return;
            }
        };
        let present: HashSet<Uuid> = records.iter().map(Record::id).collect();
        for id in uploaded.into_iter().filter(|id| !present.contains(id)) {
            let deleted = self.remote.delete(&self.user_id, id).await;
            self.telemetry
                .record(WriteTarget::Secondary, OperationKind::Delete, deleted.is_ok());
            match deleted {
                Ok(()) => debug!(record_id = %id, "removed record deleted during its upload"),
                Err(err) => {
                    warn!(record_id = %id, error = %err, "failed to remove record deleted during its upload")
                }
            }
        }
    }
}

/// Merges a remote read into the local set. Local records with changes not
/// yet synced are kept. Otherwise the remote copy wins: synced records the
/// remote no longer has are dropped and new remote records are appended.
fn merge_remote<R: Record>(local: &mut Vec<R>, remote: Vec<R>, now: DateTime<Utc>) -> bool {
    let remote: Vec<R> = remote
        .into_iter()
        .map(|mut record| {
            *record.sync_state_mut() = SyncState::synced_at(now);
            record
        })
        .collect();
    let by_id: HashMap<Uuid, &R> = remote.iter().map(|r| (r.id(), r)).collect();

    let mut merged = Vec::with_capacity(local.len().max(remote.len()));
    let mut placed = HashSet::new();
    for record in local.iter() {
        let id = record.id();
        if !record.sync_state().is_synced() {
            merged.push(record.clone());
        } else if let Some(theirs) = by_id.get(&id) {
            if same_content(record, *theirs) {
                merged.push(record.clone());
            } else {
                merged.push((*theirs).clone());
            }
        } else {
            continue;
        }
        placed.insert(id);
    }
    for record in remote {
        if !placed.contains(&record.id()) {
            merged.push(record);
        }
    }

    let changed = merged != *local;
    *local = merged;
    changed
}

pub struct DualWriteCoordinator<R: Record> {
    local: Arc<dyn RecordStore<R>>,
    remote: Arc<dyn RemoteStore<R>>,
    user_id: String,
    migration: Arc<dyn MigrationStatus>,
    policy: SyncPolicy,
    tracker: SyncStatusTracker,
    telemetry: Arc<SyncTelemetry>,
    turn: Arc<tokio::sync::Mutex<()>>,
    in_flight: InFlight,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl<R: Record> DualWriteCoordinator<R> {
    /// `user_id` scopes every remote call. An empty id is a guest: guests are
    /// never replicated.
    pub fn new(
        local: Arc<dyn RecordStore<R>>,
        remote: Arc<dyn RemoteStore<R>>,
        user_id: impl Into<String>,
    ) -> Self {
        let policy = SyncPolicy::default();
        Self {
            local,
            remote,
            user_id: user_id.into(),
            migration: Arc::new(MigratedUsers::new()),
            tracker: SyncStatusTracker::new(policy.skip_window),
            policy,
            telemetry: Arc::new(SyncTelemetry::new()),
            turn: Arc::new(tokio::sync::Mutex::new(())),
            in_flight: InFlight::default(),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.tracker = SyncStatusTracker::new(policy.skip_window);
        self.policy = policy;
        self
    }

    pub fn with_migration_status(mut self, migration: Arc<dyn MigrationStatus>) -> Self {
        self.migration = migration;
        self
    }

    /// Shares counters with other coordinators.
    pub fn with_telemetry(mut self, telemetry: Arc<SyncTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn telemetry(&self) -> Arc<SyncTelemetry> {
        self.telemetry.clone()
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    fn is_guest(&self) -> bool {
        self.user_id.is_empty()
    }

    fn sync_pass(&self) -> SyncPass<R> {
        SyncPass {
            local: self.local.clone(),
            remote: self.remote.clone(),
            user_id: self.user_id.clone(),
            tracker: self.tracker,
            telemetry: self.telemetry.clone(),
            turn: self.turn.clone(),
        }
    }

    fn spawn_sync(&self, ids: Vec<Uuid>) {
        if self.is_guest() || ids.is_empty() {
            return;
        }
        let claim = self.in_flight.claim(&ids);
        let handle = tokio::spawn(self.sync_pass().run(ids, claim));
        let mut background = self
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        background.retain(|handle| !handle.is_finished());
        background.push(handle);
    }

    /// Waits for every background pass spawned so far.
    pub async fn wait_for_background_sync(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut background = self
                .background
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            background.drain(..).collect()
        };
        for joined in futures::future::join_all(handles).await {
            if let Err(err) = joined {
                error!(user_id = %self.user_id, error = %err, "background sync task panicked");
            }
        }
    }

    /// Drops records that break their own domain rules.
    fn filter_valid(&self, records: Vec<R>) -> Vec<R> {
        let total = records.len();
        let valid: Vec<R> = records
            .into_iter()
            .filter(|record| match record.check_domain_rules() {
                Ok(()) => true,
                Err(detail) => {
                    warn!(record_id = %record.id(), %detail, "dropping invalid record from result");
                    false
                }
            })
            .collect();
        let dropped = (total - valid.len()) as u64;
        if dropped > 0 {
            self.telemetry.record_filtered(dropped);
        }
        valid
    }

    /// Writes `incoming` locally. Edited and new records become `pending`;
    /// unchanged ones keep their stored state. With `replace` the incoming
    /// records become the whole set. Returns the ids written.
    async fn write_tracked(&self, incoming: Vec<R>, replace: bool) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = incoming.iter().map(Record::id).collect();
        let edit: RecordEdit<R> = Box::new(move |stored: &mut Vec<R>| {
            let mut incoming = incoming;
            SyncStatusTracker::reconcile(stored.as_slice(), incoming.as_mut_slice());
            if replace {
                *stored = incoming;
                return true;
            }
            for record in incoming {
                match stored.iter_mut().find(|r| r.id() == record.id()) {
                    Some(slot) => *slot = record,
                    None => stored.push(record),
                }
            }
            true
        });
        let saved = self.local.edit_records(edit).await;
        self.telemetry
            .record(WriteTarget::Primary, OperationKind::Save, saved.is_ok());
        saved?;
        Ok(ids)
    }

    async fn remote_fetch(&self) -> Option<Vec<R>> {
        match self.remote.fetch_all(&self.user_id).await {
            Ok(records) => {
                self.telemetry
                    .record(WriteTarget::Secondary, OperationKind::Fetch, true);
                Some(records)
            }
            Err(err) => {
                self.telemetry
                    .record(WriteTarget::Secondary, OperationKind::Fetch, false);
                warn!(user_id = %self.user_id, error = %err, "remote fetch failed");
                None
            }
        }
    }

    /// Remote-preferred read for migrated users, merged into the local store.
    /// `None` means the caller should fall back to a local read.
    async fn load_remote_preferred(&self) -> Option<Vec<R>> {
        let remote = self.remote_fetch().await?;
        let now = Utc::now();
        let merged = self
            .local
            .edit_records(Box::new(move |local: &mut Vec<R>| {
                merge_remote(local, remote, now)
            }))
            .await;
        match merged {
            Ok(records) => Some(records),
            Err(err) => {
                warn!(user_id = %self.user_id, error = %err, "failed to merge remote records locally");
                None
            }
        }
    }

    /// One remote pull for an empty local store. Records saved locally while
    /// the pull was in flight win over the backfill.
    async fn backfill(&self) -> Vec<R> {
        let Some(mut remote) = self.remote_fetch().await else {
            return Vec::new();
        };
        if remote.is_empty() {
            return remote;
        }
        debug!(user_id = %self.user_id, records = remote.len(), "backfilling local store from remote");
        let now = Utc::now();
        for record in &mut remote {
            *record.sync_state_mut() = SyncState::synced_at(now);
        }
        match self.local.merge_missing(remote.clone()).await {
            Ok(records) => records,
            Err(err) => {
                warn!(user_id = %self.user_id, error = %err, "failed to backfill local store");
                remote
            }
        }
    }

    pub async fn load_all(&self) -> Result<Vec<R>> {
        if self.policy.read_policy == ReadPolicy::RemotePreferred
            && !self.is_guest()
            && self.migration.is_fully_migrated(&self.user_id).await
        {
            if let Some(records) = self.load_remote_preferred().await {
                return Ok(self.filter_valid(records));
            }
        }

        let loaded = self.local.load().await;
        self.telemetry
            .record(WriteTarget::Primary, OperationKind::Fetch, loaded.is_ok());
        let local = loaded?;
        if !local.is_empty() || self.is_guest() {
            return Ok(self.filter_valid(local));
        }

        let records = self.backfill().await;
        Ok(self.filter_valid(records))
    }

    /// Schedules one background pass over every local record that is not
    /// `synced` and not already owned by a running pass. Returns how many
    /// records were scheduled.
    pub async fn resume_pending_sync(&self) -> Result<usize> {
        if self.is_guest() {
            return Ok(0);
        }
        let records = self.local.load().await?;
        let pending: Vec<Uuid> = self
            .tracker
            .unsynced_ids(&records)
            .into_iter()
            .filter(|id| !self.in_flight.contains(id))
            .collect();
        let count = pending.len();
        if count > 0 {
            debug!(user_id = %self.user_id, count, "resuming unsynced records");
            self.spawn_sync(pending);
        }
        Ok(count)
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for DualWriteCoordinator<R> {
    async fn load(&self) -> Result<Vec<R>> {
        self.load_all().await
    }

    async fn save_all(&self, records: Vec<R>) -> Result<()> {
        let ids = self.write_tracked(records, true).await?;
        self.spawn_sync(ids);
        Ok(())
    }

    async fn save_one(&self, record: R) -> Result<()> {
        let ids = self.write_tracked(vec![record], false).await?;
        self.spawn_sync(ids);
        Ok(())
    }

    /// Remote first, then local. A remote failure does not stop the local
    /// delete; it is reported as [`DeleteOutcome::Degraded`]. Waits for a
    /// running pass so it cannot upload the record after the remote delete.
    async fn delete_one(&self, id: Uuid) -> Result<DeleteOutcome> {
        let _turn = self.turn.lock().await;
        let mut remote_failure = None;
        if !self.is_guest() {
            let deleted = self.remote.delete(&self.user_id, id).await;
            self.telemetry
                .record(WriteTarget::Secondary, OperationKind::Delete, deleted.is_ok());
            if let Err(err) = deleted {
                remote_failure = Some(err.to_string());
            }
        }

        let deleted = self.local.delete_one(id).await;
        self.telemetry
            .record(WriteTarget::Primary, OperationKind::Delete, deleted.is_ok());
        let outcome = deleted?;

        match remote_failure {
            Some(reason) => {
                warn!(record_id = %id, %reason, "deleted locally but remote delete failed");
                Ok(DeleteOutcome::Degraded { reason })
            }
            None => Ok(outcome),
        }
    }

    /// Clears the local store only. The remote copy is left untouched, so a
    /// running pass is waited for rather than seen as a concurrent delete.
    async fn clear_all(&self) -> Result<()> {
        let _turn = self.turn.lock().await;
        let cleared = self.local.clear_all().await;
        self.telemetry
            .record(WriteTarget::Primary, OperationKind::Clear, cleared.is_ok());
        cleared
    }

    async fn edit_records(&self, edit: RecordEdit<R>) -> Result<Vec<R>> {
        self.local.edit_records(edit).await
    }

    /// Inserts records not stored yet and schedules them for replication.
    async fn merge_missing(&self, incoming: Vec<R>) -> Result<Vec<R>> {
        let ids: Vec<Uuid> = incoming.iter().map(Record::id).collect();
        let merged = self.local.merge_missing(incoming).await;
        self.telemetry
            .record(WriteTarget::Primary, OperationKind::Save, merged.is_ok());
        let merged = merged?;
        self.spawn_sync(ids);
        Ok(merged)
    }

    fn invalidate_cache(&self) {
        self.local.invalidate_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StoreError, SyncStatus};
    use crate::model::Goal;
    use crate::storage::{AtomicPersistentStore, FixedDiskSpace, StoreConfig};
    use crate::sync::remote::InMemoryRemoteStore;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        disk: Arc<FixedDiskSpace>,
        local: Arc<AtomicPersistentStore<Goal>>,
        remote: InMemoryRemoteStore<Goal>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let disk = Arc::new(FixedDiskSpace::new(u64::MAX));
            let local = Arc::new(
                AtomicPersistentStore::open(
                    dir.path(),
                    "goals",
                    StoreConfig::new().safety_floor_bytes(0),
                )
                .unwrap()
                .with_disk_probe(disk.clone()),
            );
            Self {
                _dir: dir,
                disk,
                local,
                remote: InMemoryRemoteStore::new(),
            }
        }

        fn coordinator(&self, user_id: &str) -> DualWriteCoordinator<Goal> {
            let local: Arc<dyn RecordStore<Goal>> = self.local.clone();
            let remote: Arc<dyn RemoteStore<Goal>> = Arc::new(self.remote.clone());
            DualWriteCoordinator::new(local, remote, user_id)
        }
    }

    #[tokio::test]
    async fn test_save_replicates_in_background() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator("alice");
        let goal = Goal::decreasing("coffee", 4.0, 1.0);

        coordinator.save_one(goal.clone()).await.unwrap();
        coordinator.wait_for_background_sync().await;

        let local = fx.local.load().await.unwrap();
        assert_eq!(local[0].sync.status, SyncStatus::Synced);
        assert!(local[0].sync.last_synced_at.is_some());
        assert_eq!(fx.remote.records("alice").await.len(), 1);

        let snapshot = coordinator.telemetry_snapshot();
        assert_eq!(snapshot.primary.save.success, 1);
        assert_eq!(snapshot.secondary.save.success, 1);
        assert_eq!(snapshot.sync_attempts, 1);
    }

    #[tokio::test]
    async fn test_local_failure_schedules_no_sync() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator("alice");
        fx.disk.set(0);

        let err = coordinator
            .save_one(Goal::decreasing("coffee", 4.0, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DiskSpace(_)));
        coordinator.wait_for_background_sync().await;

        assert_eq!(fx.remote.upsert_count(), 0);
        assert_eq!(coordinator.telemetry_snapshot().sync_attempts, 0);
        assert_eq!(coordinator.telemetry_snapshot().primary.save.failure, 1);
    }

    #[tokio::test]
    async fn test_remote_failure_marks_failed() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator("alice");
        fx.remote.set_failing(true);
        let goal = Goal::decreasing("coffee", 4.0, 1.0);

        coordinator.save_one(goal.clone()).await.unwrap();
        coordinator.wait_for_background_sync().await;

        let local = fx.local.load().await.unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].sync.status, SyncStatus::Failed);
        assert_eq!(coordinator.telemetry_snapshot().secondary.save.failure, 1);
    }

    #[tokio::test]
    async fn test_recently_synced_records_are_skipped() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator("alice");
        let goal = Goal::decreasing("coffee", 4.0, 1.0);
        coordinator.save_one(goal).await.unwrap();
        coordinator.wait_for_background_sync().await;

        let synced = fx.local.load().await.unwrap();
        coordinator.save_all(synced).await.unwrap();
        coordinator.wait_for_background_sync().await;
        assert_eq!(fx.remote.upsert_count(), 1);

        let eager = fx
            .coordinator("alice")
            .with_policy(SyncPolicy::new().skip_window(Duration::ZERO));
        eager.save_all(fx.local.load().await.unwrap()).await.unwrap();
        eager.wait_for_background_sync().await;
        assert_eq!(fx.remote.upsert_count(), 2);
    }

    #[tokio::test]
    async fn test_degraded_delete() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator("alice");
        let goal = Goal::decreasing("coffee", 4.0, 1.0);
        coordinator.save_one(goal.clone()).await.unwrap();
        coordinator.wait_for_background_sync().await;

        fx.remote.set_failing(true);
        let outcome = coordinator.delete_one(goal.id).await.unwrap();
        assert!(outcome.is_degraded());
        assert!(fx.local.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guest_is_local_only() {
        let fx = Fixture::new();
        let coordinator = fx.coordinator("");
        coordinator
            .save_one(Goal::decreasing("coffee", 4.0, 1.0))
            .await
            .unwrap();
        coordinator.wait_for_background_sync().await;
        assert_eq!(coordinator.load().await.unwrap().len(), 1);
        assert_eq!(fx.remote.upsert_count(), 0);
        assert_eq!(fx.remote.fetch_count(), 0);
    }

    #[test]
    fn test_merge_remote_keeps_unsynced_local_changes() {
        let now = Utc::now();
        let mut synced = Goal::increasing("synced", 1.0, 2.0);
        synced.sync = SyncState::synced_at(now);
        let mut dropped_remotely = Goal::increasing("gone remotely", 1.0, 2.0);
        dropped_remotely.sync = SyncState::synced_at(now);
        let mut failed = Goal::increasing("offline edit", 1.0, 2.0);
        failed.sync = SyncState::new(SyncStatus::Failed);
        let mut local = vec![synced.clone(), dropped_remotely, failed.clone()];

        let newer = synced.clone().with_notes("edited elsewhere");
        let stale_copy = failed.clone().with_notes("older remote copy");
        let added = Goal::increasing("added elsewhere", 1.0, 2.0);
        assert!(merge_remote(
            &mut local,
            vec![newer.clone(), stale_copy, added.clone()],
            now
        ));

        let titles: Vec<_> = local.iter().map(|goal| goal.title.as_str()).collect();
        assert_eq!(titles, vec!["synced", "offline edit", "added elsewhere"]);
        assert_eq!(local[0].notes, newer.notes);
        assert_eq!(local[1], failed);
        assert!(local[2].sync.is_synced());

        let unchanged = local.clone();
        assert!(!merge_remote(&mut local, vec![newer, failed, added], now));
        assert_eq!(local, unchanged);
    }

    #[tokio::test]
    async fn test_resume_pending_sync() {
        let fx = Fixture::new();
        let mut stale = Goal::increasing("steps", 1_000.0, 10_000.0);
        stale.sync = SyncState::new(SyncStatus::Syncing);
        fx.local.save_one(stale.clone()).await.unwrap();

        let coordinator = fx.coordinator("alice");
        assert_eq!(coordinator.resume_pending_sync().await.unwrap(), 1);
        coordinator.wait_for_background_sync().await;

        assert_eq!(fx.local.load().await.unwrap()[0].sync.status, SyncStatus::Synced);
        assert_eq!(coordinator.resume_pending_sync().await.unwrap(), 0);
    }
}

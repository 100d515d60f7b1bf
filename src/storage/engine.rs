use crate::core::{Record, Result, SyncState};
use async_trait::async_trait;
use std::collections::HashSet;
use uuid::Uuid;

/// Result of a delete that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// The local copy is gone but a secondary target could not be updated.
    Degraded { reason: String },
}

impl DeleteOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// Change applied to the full record set while the store's writer lock is
/// held. Returns whether anything changed; an unchanged set is not written.
pub type RecordEdit<R> = Box<dyn FnOnce(&mut Vec<R>) -> bool + Send>;

/// Record store trait - allows pluggable storage backends
#[async_trait]
pub trait RecordStore<R: Record>: Send + Sync {
    /// Load the full record set
    async fn load(&self) -> Result<Vec<R>>;

    /// Replace the full record set
    async fn save_all(&self, records: Vec<R>) -> Result<()>;

    /// Insert or replace one record
    async fn save_one(&self, record: R) -> Result<()>;

    /// Remove one record by id
    async fn delete_one(&self, id: Uuid) -> Result<DeleteOutcome>;

    /// Remove every record
    async fn clear_all(&self) -> Result<()>;

    /// Read-modify-write of the record set under the writer lock. Returns
    /// the records as they stand afterwards.
    async fn edit_records(&self, edit: RecordEdit<R>) -> Result<Vec<R>>;

    /// Apply sync-state changes to records that still exist. Returns the ids
    /// that were present.
    async fn update_sync_states(&self, updates: Vec<(Uuid, SyncState)>) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = updates.iter().map(|(id, _)| *id).collect();
        let records = self
            .edit_records(Box::new(move |records: &mut Vec<R>| {
                apply_sync_states(records, updates)
            }))
            .await?;
        let present: HashSet<Uuid> = records.iter().map(Record::id).collect();
        Ok(ids.into_iter().filter(|id| present.contains(id)).collect())
    }

    /// Insert the records whose ids are not stored yet. Stored records win.
    /// Returns the full record set afterwards.
    async fn merge_missing(&self, incoming: Vec<R>) -> Result<Vec<R>> {
        self.edit_records(Box::new(move |records: &mut Vec<R>| {
            let existing: HashSet<Uuid> = records.iter().map(Record::id).collect();
            let before = records.len();
            records.extend(
                incoming
                    .into_iter()
                    .filter(|record| !existing.contains(&record.id())),
            );
            records.len() != before
        }))
        .await
    }

    /// Drop any in-memory copy so the next load reads from disk
    fn invalidate_cache(&self);
}

fn apply_sync_states<R: Record>(records: &mut [R], updates: Vec<(Uuid, SyncState)>) -> bool {
    let mut changed = false;
    for (id, state) in updates {
        if let Some(record) = records.iter_mut().find(|r| r.id() == id) {
            if *record.sync_state() != state {
                *record.sync_state_mut() = state;
                changed = true;
            }
        }
    }
    changed
}

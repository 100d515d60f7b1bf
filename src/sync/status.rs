//! Per-record replication state transitions.
//!
//! The state itself lives on the record ([`SyncState`]) so it is persisted
//! with it; this module only decides how it moves.

use crate::core::{Record, SyncState, SyncStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct SyncStatusTracker {
    skip_window: Duration,
}

impl SyncStatusTracker {
    pub fn new(skip_window: Duration) -> Self {
        Self { skip_window }
    }

    pub fn skip_window(&self) -> Duration {
        self.skip_window
    }

    /// Prepares records about to be written locally against the stored
    /// copies. New or edited records become `pending`; a record whose content
    /// is unchanged keeps its stored state, so the skip window still applies
    /// to it.
    pub fn reconcile<R: Record>(stored: &[R], incoming: &mut [R]) {
        let stored: HashMap<Uuid, &R> = stored.iter().map(|r| (r.id(), r)).collect();
        for record in incoming {
            match stored.get(&record.id()) {
                Some(current) if same_content(*current, &*record) => {
                    *record.sync_state_mut() = current.sync_state().clone();
                }
                _ => *record.sync_state_mut() = SyncState::new(SyncStatus::Pending),
            }
        }
    }

    /// A record needs a remote upsert unless it was synced within the skip
    /// window.
    pub fn needs_sync<R: Record>(&self, record: &R, now: DateTime<Utc>) -> bool {
        let state = record.sync_state();
        match (state.status, state.last_synced_at) {
            (SyncStatus::Synced, Some(at)) => match (now - at).to_std() {
                Ok(elapsed) => elapsed >= self.skip_window,
                // Synced "in the future" after a clock step back counts as recent.
                Err(_) => false,
            },
            _ => true,
        }
    }

    /// Ids of records left in any state other than `synced`, e.g. by a crash
    /// during a background pass.
    pub fn unsynced_ids<R: Record>(&self, records: &[R]) -> Vec<Uuid> {
        records
            .iter()
            .filter(|r| !r.sync_state().is_synced())
            .map(|r| r.id())
            .collect()
    }

    /// Claimed by a background pass. Keeps the last successful timestamp.
    pub fn syncing(previous: &SyncState) -> SyncState {
        SyncState {
            status: SyncStatus::Syncing,
            last_synced_at: previous.last_synced_at,
        }
    }

    pub fn synced(now: DateTime<Utc>) -> SyncState {
        SyncState::synced_at(now)
    }

    /// A failed upsert keeps the last successful timestamp.
    pub fn failed(previous: &SyncState) -> SyncState {
        SyncState {
            status: SyncStatus::Failed,
            last_synced_at: previous.last_synced_at,
        }
    }
}

/// Equal apart from sync state.
pub fn same_content<R: Record>(a: &R, b: &R) -> bool {
    if a.id() != b.id() {
        return false;
    }
    let mut aligned = a.clone();
    *aligned.sync_state_mut() = b.sync_state().clone();
    aligned == *b
}

impl Default for SyncStatusTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Goal;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_reconcile_only_keeps_state_of_unchanged_records() {
        let now = Utc::now();
        let mut unchanged = Goal::increasing("a", 1.0, 2.0);
        unchanged.sync = SyncState::synced_at(now);
        let mut edited = Goal::increasing("b", 1.0, 2.0);
        edited.sync = SyncState::synced_at(now);
        let mut failed = Goal::increasing("c", 1.0, 2.0);
        failed.sync = SyncState::new(SyncStatus::Failed);
        let stored = vec![unchanged.clone(), edited.clone(), failed.clone()];

        let mut stale = unchanged.clone();
        stale.sync = SyncState::new(SyncStatus::Pending);
        let mut incoming = vec![
            stale,
            edited.with_notes("changed"),
            failed,
            Goal::increasing("d", 1.0, 2.0),
        ];
        SyncStatusTracker::reconcile(&stored, &mut incoming);

        assert_eq!(incoming[0].sync, SyncState::synced_at(now));
        assert_eq!(incoming[1].sync.status, SyncStatus::Pending);
        assert_eq!(incoming[2].sync.status, SyncStatus::Failed);
        assert_eq!(incoming[3].sync.status, SyncStatus::Pending);
    }

    #[test]
    fn test_same_content_ignores_sync_state() {
        let goal = Goal::increasing("a", 1.0, 2.0);
        let mut synced = goal.clone();
        synced.sync = SyncState::synced_at(Utc::now());
        assert!(same_content(&goal, &synced));
        assert!(!same_content(&goal, &goal.clone().with_notes("x")));
        assert!(!same_content(&goal, &Goal::increasing("a", 1.0, 2.0)));
    }

    #[test]
    fn test_skip_window() {
        let tracker = SyncStatusTracker::new(Duration::from_secs(60));
        let now = Utc::now();
        let mut goal = Goal::increasing("a", 1.0, 2.0);
        assert!(tracker.needs_sync(&goal, now));

        goal.sync = SyncState::synced_at(now - ChronoDuration::seconds(10));
        assert!(!tracker.needs_sync(&goal, now));

        goal.sync = SyncState::synced_at(now - ChronoDuration::seconds(61));
        assert!(tracker.needs_sync(&goal, now));

        goal.sync = SyncState::new(SyncStatus::Failed);
        assert!(tracker.needs_sync(&goal, now));
    }

    #[test]
    fn test_failed_keeps_last_success() {
        let at = Utc::now();
        let syncing = SyncStatusTracker::syncing(&SyncState::synced_at(at));
        assert_eq!(syncing.status, SyncStatus::Syncing);
        let failed = SyncStatusTracker::failed(&syncing);
        assert_eq!(failed.status, SyncStatus::Failed);
        assert_eq!(failed.last_synced_at, Some(at));
    }

    #[test]
    fn test_unsynced_ids() {
        let tracker = SyncStatusTracker::default();
        let mut synced = Goal::increasing("a", 1.0, 2.0);
        synced.sync = SyncState::synced_at(Utc::now());
        let pending = Goal::increasing("b", 1.0, 2.0);
        let ids = tracker.unsynced_ids(&[synced, pending.clone()]);
        assert_eq!(ids, vec![pending.id]);
    }
}

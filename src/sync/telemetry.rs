use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Save,
    Delete,
    Clear,
    Fetch,
}

/// Which side of a dual write an outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteTarget {
    /// The local store
    Primary,
    /// The remote store
    Secondary,
}

#[derive(Debug, Default)]
struct OutcomeCounters {
    success: AtomicU64,
    failure: AtomicU64,
}

impl OutcomeCounters {
    fn record(&self, ok: bool) {
        let counter = if ok { &self.success } else { &self.failure };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn snapshot(&self) -> OutcomeCounts {
        OutcomeCounts {
            success: self.success.load(AtomicOrdering::Relaxed),
            failure: self.failure.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct KindCounters {
    save: OutcomeCounters,
    delete: OutcomeCounters,
    clear: OutcomeCounters,
    fetch: OutcomeCounters,
}

impl KindCounters {
    fn of(&self, kind: OperationKind) -> &OutcomeCounters {
        match kind {
            OperationKind::Save => &self.save,
            OperationKind::Delete => &self.delete,
            OperationKind::Clear => &self.clear,
            OperationKind::Fetch => &self.fetch,
        }
    }

    fn snapshot(&self) -> KindCounts {
        KindCounts {
            save: self.save.snapshot(),
            delete: self.delete.snapshot(),
            clear: self.clear.snapshot(),
            fetch: self.fetch.snapshot(),
        }
    }
}

/// Lock-free counters shared between the coordinator and its background
/// sync tasks.
#[derive(Debug, Default)]
pub struct SyncTelemetry {
    primary: KindCounters,
    secondary: KindCounters,
    sync_attempts: AtomicU64,
    filtered_records: AtomicU64,
}

impl SyncTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, target: WriteTarget, kind: OperationKind, ok: bool) {
        let counters = match target {
            WriteTarget::Primary => &self.primary,
            WriteTarget::Secondary => &self.secondary,
        };
        counters.of(kind).record(ok);
    }

    /// Counts one remote upsert attempted by a background pass.
    pub fn record_sync_attempt(&self) {
        self.sync_attempts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_filtered(&self, count: u64) {
        self.filtered_records.fetch_add(count, AtomicOrdering::Relaxed);
    }

    pub fn sync_attempts(&self) -> u64 {
        self.sync_attempts.load(AtomicOrdering::Relaxed)
    }

    pub fn filtered_records(&self) -> u64 {
        self.filtered_records.load(AtomicOrdering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            primary: self.primary.snapshot(),
            secondary: self.secondary.snapshot(),
            sync_attempts: self.sync_attempts(),
            filtered_records: self.filtered_records(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub success: u64,
    pub failure: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    pub save: OutcomeCounts,
    pub delete: OutcomeCounts,
    pub clear: OutcomeCounts,
    pub fetch: OutcomeCounts,
}

impl KindCounts {
    pub fn of(&self, kind: OperationKind) -> OutcomeCounts {
        match kind {
            OperationKind::Save => self.save,
            OperationKind::Delete => self.delete,
            OperationKind::Clear => self.clear,
            OperationKind::Fetch => self.fetch,
        }
    }
}

/// Point-in-time copy of [`SyncTelemetry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub primary: KindCounts,
    pub secondary: KindCounts,
    pub sync_attempts: u64,
    pub filtered_records: u64,
}

use super::error::{Result, StoreError};
use super::record::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use uuid::Uuid;

pub const DEFAULT_SCHEMA_VERSION: &str = "1.0.0";

/// The unit of atomic persistence: versioned metadata plus the full record set.
///
/// Every mutation consumes the container and returns a new value, so a save
/// always persists one complete snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container<R> {
    pub schema_version: String,
    pub records: Vec<R>,
    #[serde(default)]
    pub completed_migration_steps: BTreeSet<String>,
    pub last_updated: DateTime<Utc>,
}

impl<R: Record> Container<R> {
    pub fn empty(schema_version: impl Into<String>) -> Self {
        Self {
            schema_version: schema_version.into(),
            records: Vec::new(),
            completed_migration_steps: BTreeSet::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn with_records(mut self, records: Vec<R>) -> Self {
        self.records = records;
        self.touch()
    }

    /// Replaces the record with the same id in place, or appends it.
    pub fn upsert(mut self, record: R) -> Self {
        match self.records.iter().position(|r| r.id() == record.id()) {
            Some(idx) => self.records[idx] = record,
            None => self.records.push(record),
        }
        self.touch()
    }

    /// Returns the new container and whether a record was removed.
    pub fn remove(mut self, id: Uuid) -> (Self, bool) {
        let before = self.records.len();
        self.records.retain(|r| r.id() != id);
        let removed = self.records.len() != before;
        (self.touch(), removed)
    }

    pub fn complete_migration_step(mut self, step: impl Into<String>) -> Self {
        self.completed_migration_steps.insert(step.into());
        self.touch()
    }

    pub fn has_completed_step(&self, step: &str) -> bool {
        self.completed_migration_steps.contains(step)
    }

    fn touch(mut self) -> Self {
        self.last_updated = Utc::now();
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| StoreError::Encoding(format!("Failed to serialize container: {}", e)))
    }

    pub fn from_bytes(path: &Path, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Decoding {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

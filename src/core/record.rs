use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use uuid::Uuid;

/// Replication progress of a single record towards the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Unsynced,
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unsynced => "unsynced",
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

/// Sync status plus the time of the last successful remote upsert. Stored
/// inline with the record so it survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn new(status: SyncStatus) -> Self {
        Self {
            status,
            last_synced_at: None,
        }
    }

    pub fn synced_at(at: DateTime<Utc>) -> Self {
        Self {
            status: SyncStatus::Synced,
            last_synced_at: Some(at),
        }
    }

    pub fn is_synced(&self) -> bool {
        self.status == SyncStatus::Synced
    }
}

/// A start/end date pair a record exposes for ordering checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateSpan {
    pub field: &'static str,
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
}

/// An entity persisted inside a [`Container`](crate::Container).
///
/// Implementors expose their text and date fields so the container validator
/// can check them without knowing the concrete type, and declare their own
/// domain rules through [`Record::check_domain_rules`].
pub trait Record:
    Serialize + DeserializeOwned + Clone + fmt::Debug + PartialEq + Send + Sync + 'static
{
    fn id(&self) -> Uuid;

    fn sync_state(&self) -> &SyncState;

    fn sync_state_mut(&mut self) -> &mut SyncState;

    fn text_fields(&self) -> Vec<(&'static str, &str)> {
        Vec::new()
    }

    fn date_spans(&self) -> Vec<DateSpan> {
        Vec::new()
    }

    /// Domain invariants. The error string names the violated rule.
    fn check_domain_rules(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

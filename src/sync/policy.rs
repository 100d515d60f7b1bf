use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where [`load`](super::DualWriteCoordinator::load_all) looks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPolicy {
    /// Read the local store; pull from remote only when it is empty.
    #[default]
    LocalFirst,
    /// Read the remote store when the user's data is fully migrated, mirror it
    /// locally, fall back to local on failure.
    RemotePreferred,
}

/// Tuning for a [`DualWriteCoordinator`](super::DualWriteCoordinator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Records synced more recently than this are not upserted again.
    pub skip_window: Duration,
    pub read_policy: ReadPolicy,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            skip_window: Duration::from_secs(60),
            read_policy: ReadPolicy::LocalFirst,
        }
    }
}

impl SyncPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_window(mut self, window: Duration) -> Self {
        self.skip_window = window;
        self
    }

    pub fn read_policy(mut self, policy: ReadPolicy) -> Self {
        self.read_policy = policy;
        self
    }
}

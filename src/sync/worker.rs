use super::coordinator::DualWriteCoordinator;
use crate::core::{Record, Result, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::warn;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Background worker that periodically re-schedules unsynced records.
pub struct ResyncWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl ResyncWorker {
    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| StoreError::Internal(format!("resync worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for ResyncWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Runs [`DualWriteCoordinator::resume_pending_sync`] every `interval` until
/// stopped.
pub fn spawn_resync_worker<R: Record>(
    coordinator: Arc<DualWriteCoordinator<R>>,
    interval: Duration,
) -> ResyncWorker {
    let interval = interval.max(MIN_INTERVAL);
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    if let Err(err) = coordinator.resume_pending_sync().await {
                        warn!(user_id = %coordinator.user_id(), error = %err, "resync tick failed");
                    }
                }
            }
        }
        coordinator.wait_for_background_sync().await;
    });

    ResyncWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SyncState, SyncStatus};
    use crate::model::Goal;
    use crate::storage::{AtomicPersistentStore, FixedDiskSpace, RecordStore, StoreConfig};
    use crate::sync::remote::{InMemoryRemoteStore, RemoteStore};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_worker_resyncs_failed_records() {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(
            AtomicPersistentStore::<Goal>::open(
                dir.path(),
                "goals",
                StoreConfig::new().safety_floor_bytes(0),
            )
            .unwrap()
            .with_disk_probe(Arc::new(FixedDiskSpace::new(u64::MAX))),
        );
        let mut failed = Goal::increasing("water", 1.0, 8.0);
        failed.sync = SyncState::new(SyncStatus::Failed);
        local.save_one(failed).await.unwrap();

        let remote = InMemoryRemoteStore::<Goal>::new();
        let local_dyn: Arc<dyn RecordStore<Goal>> = local.clone();
        let remote_dyn: Arc<dyn RemoteStore<Goal>> = Arc::new(remote.clone());
        let coordinator = Arc::new(DualWriteCoordinator::new(local_dyn, remote_dyn, "alice"));

        let worker = spawn_resync_worker(coordinator.clone(), Duration::from_millis(20));
        let mut synced = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if local.load().await.unwrap()[0].sync.is_synced() {
                synced = true;
                break;
            }
        }
        worker.stop().await.unwrap();

        assert!(synced);
        assert_eq!(remote.records("alice").await.len(), 1);
    }
}

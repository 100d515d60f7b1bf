pub mod coordinator;
pub mod policy;
pub mod remote;
pub mod status;
pub mod telemetry;
pub mod worker;

pub use coordinator::DualWriteCoordinator;
pub use policy::{ReadPolicy, SyncPolicy};
pub use remote::{
    IdentityProvider, InMemoryRemoteStore, MigratedUsers, MigrationStatus, RemoteStore,
    SwitchableIdentity,
};
pub use status::{SyncStatusTracker, same_content};
pub use telemetry::{
    KindCounts, OperationKind, OutcomeCounts, SyncTelemetry, TelemetrySnapshot, WriteTarget,
};
pub use worker::{ResyncWorker, spawn_resync_worker};

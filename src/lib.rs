// ============================================================================
// dualstore Library
// ============================================================================

pub mod core;
pub mod model;
pub mod scope;
pub mod storage;
pub mod sync;

// Re-export main types for convenience
pub use core::{
    Container, DateSpan, DiskSpaceError, IntegrityError, Record, Result, StoreError, SyncState,
    SyncStatus,
};
pub use model::{Goal, GoalDirection};
pub use scope::{CoordinatedStoreFactory, LocalStoreFactory, ScopedStoreFactory, UserScopeWrapper};
pub use storage::{
    AtomicPersistentStore, DeleteOutcome, RecordEdit, RecordStore, SegmentConfig, SegmentedStore,
    StoreConfig,
};
pub use sync::{
    DualWriteCoordinator, IdentityProvider, InMemoryRemoteStore, MigrationStatus, ReadPolicy,
    RemoteStore, SyncPolicy, SyncTelemetry, TelemetrySnapshot, spawn_resync_worker,
};

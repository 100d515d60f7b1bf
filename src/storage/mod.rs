pub mod atomic;
pub mod config;
pub mod engine;
pub mod fs_support;
pub mod generations;
pub mod segmented;
pub mod validator;

pub use atomic::AtomicPersistentStore;
pub use config::{MB, SegmentConfig, StoreConfig};
pub use engine::{DeleteOutcome, RecordEdit, RecordStore};
pub use fs_support::{
    DiskSpaceProbe, FileProtection, FixedDiskSpace, OwnerOnlyProtection, SystemDiskSpace,
    ensure_capacity,
};
pub use generations::{Generation, GenerationFiles, GenerationReport, LoadSource};
pub use segmented::{HistoryPartition, SegmentedStore, YearMonth};
pub use validator::{ContainerValidator, ValidationContext, ValidationRule};

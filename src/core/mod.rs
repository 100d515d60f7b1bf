pub mod container;
pub mod error;
pub mod record;

pub use container::{Container, DEFAULT_SCHEMA_VERSION};
pub use error::{DiskSpaceError, IntegrityError, Result, StoreError};
pub use record::{DateSpan, Record, SyncState, SyncStatus};

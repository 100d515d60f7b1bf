use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Filesystem error while trying to {action} '{path}': {source}")]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decoding error in '{path}': {message}")]
    Decoding { path: PathBuf, message: String },

    #[error(transparent)]
    DiskSpace(#[from] DiskSpaceError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("Payload of {size} bytes exceeds the {limit} byte partition cap: {remediation}")]
    SizeExceeded {
        size: u64,
        limit: u64,
        remediation: String,
    },

    #[error("Invalid store key: {0}")]
    InvalidKey(String),

    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub(crate) fn fs(
        action: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Filesystem {
            action,
            path: path.into(),
            source,
        }
    }

    /// True for errors raised by the local persistence path.
    pub fn is_local(&self) -> bool {
        !matches!(self, Self::Remote(_))
    }
}

/// Raised by the pre-write capacity check. Nothing on disk has been touched
/// when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiskSpaceError {
    #[error(
        "Insufficient disk space: writing needs {required} bytes but only {available} are available; free up storage and retry"
    )]
    Insufficient { required: u64, available: u64 },

    #[error(
        "Disk space low: {available} bytes available, {required} needed for the write plus a {buffer} byte safety buffer; free up storage and retry"
    )]
    Low {
        required: u64,
        buffer: u64,
        available: u64,
    },

    #[error("Unable to determine available disk space: {0}")]
    Unknown(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegrityError {
    #[error("Duplicate record ids: {0:?}")]
    DuplicateIds(Vec<Uuid>),

    #[error("Invalid schema version '{0}'")]
    InvalidVersion(String),

    #[error("Serialized container is {size} bytes, above the {limit} byte ceiling")]
    OversizePayload { size: u64, limit: u64 },

    #[error("Record {record_id} has invalid text in field '{field}'")]
    InvalidEncoding { record_id: Uuid, field: String },

    #[error("Record {record_id} has invalid date ordering: {detail}")]
    InvalidDateOrdering { record_id: Uuid, detail: String },

    #[error("Record {record_id} violates a domain rule: {detail}")]
    DomainViolation { record_id: Uuid, detail: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {}", err))
    }
}

use crate::core::DEFAULT_SCHEMA_VERSION;

pub const MB: u64 = 1024 * 1024;

/// Configuration for an [`AtomicPersistentStore`](super::AtomicPersistentStore)
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Schema version stamped on containers created by this store
    pub schema_version: String,

    /// Peak transient disk usage of one save, as a multiple of the payload
    /// (temp file + main + backup copy)
    pub write_amplification: f64,

    /// Minimum free space that must remain after a write
    pub safety_floor_bytes: u64,

    /// Hard ceiling on the serialized container size
    pub max_payload_bytes: u64,

    /// Write through a temp file and rename. When false the main file is
    /// overwritten in place and fsynced.
    pub atomic_writes: bool,

    /// Accept records whose start date lies in the future
    pub allow_future_start: bool,

    /// Reject records breaking their own domain rules at write time
    pub strict_domain_validation: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
            write_amplification: 3.0,
            safety_floor_bytes: 100 * MB,
            max_payload_bytes: 100 * MB,
            atomic_writes: true,
            allow_future_start: false,
            strict_domain_validation: false,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the schema version for new containers
    pub fn schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    /// Set the write amplification factor
    pub fn write_amplification(mut self, factor: f64) -> Self {
        self.write_amplification = factor.max(1.0);
        self
    }

    /// Set the free-space floor
    pub fn safety_floor_bytes(mut self, bytes: u64) -> Self {
        self.safety_floor_bytes = bytes;
        self
    }

    /// Set the payload ceiling
    pub fn max_payload_bytes(mut self, bytes: u64) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    pub fn atomic_writes(mut self, enabled: bool) -> Self {
        self.atomic_writes = enabled;
        self
    }

    pub fn allow_future_start(mut self, allowed: bool) -> Self {
        self.allow_future_start = allowed;
        self
    }

    pub fn strict_domain_validation(mut self, enabled: bool) -> Self {
        self.strict_domain_validation = enabled;
        self
    }
}

/// Configuration for a [`SegmentedStore`](super::SegmentedStore)
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    pub store: StoreConfig,

    /// Ceiling on the serialized hot partition
    pub hot_cap_bytes: u64,

    /// Months of history kept by
    /// [`purge_expired_history`](super::SegmentedStore::purge_expired_history)
    pub retention_months: Option<u32>,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            hot_cap_bytes: 5 * MB,
            retention_months: None,
        }
    }
}

impl SegmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn hot_cap_bytes(mut self, bytes: u64) -> Self {
        self.hot_cap_bytes = bytes;
        self
    }

    pub fn retention_months(mut self, months: u32) -> Self {
        self.retention_months = Some(months);
        self
    }
}

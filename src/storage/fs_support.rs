//! Platform seams used by the file stores: free-space queries and at-rest
//! protection. Both are traits so tests can inject exhaustion and failures.

use super::config::StoreConfig;
use crate::core::{DiskSpaceError, Result, StoreError};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub trait DiskSpaceProbe: Send + Sync {
    /// Bytes available to this process on the volume holding `dir`.
    fn available_bytes(&self, dir: &Path) -> std::io::Result<u64>;
}

/// Queries the filesystem through `fs2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDiskSpace;

impl DiskSpaceProbe for SystemDiskSpace {
    fn available_bytes(&self, dir: &Path) -> std::io::Result<u64> {
        fs2::available_space(dir)
    }
}

/// Reports a fixed, adjustable amount of free space.
#[derive(Debug, Default)]
pub struct FixedDiskSpace {
    available: AtomicU64,
}

impl FixedDiskSpace {
    pub fn new(available: u64) -> Self {
        Self {
            available: AtomicU64::new(available),
        }
    }

    pub fn set(&self, available: u64) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl DiskSpaceProbe for FixedDiskSpace {
    fn available_bytes(&self, _dir: &Path) -> std::io::Result<u64> {
        Ok(self.available.load(Ordering::SeqCst))
    }
}

/// Checks that a payload of `size` bytes can be written into `dir`.
///
/// The write itself needs `size * write_amplification` bytes. On top of that
/// `max(2 * size, safety_floor_bytes)` must stay free.
pub fn ensure_capacity(
    probe: &dyn DiskSpaceProbe,
    dir: &Path,
    size: u64,
    config: &StoreConfig,
) -> Result<()> {
    let available = probe
        .available_bytes(dir)
        .map_err(|e| DiskSpaceError::Unknown(format!("{}: {}", dir.display(), e)))?;

    let required = (size as f64 * config.write_amplification).ceil() as u64;
    if available < required {
        return Err(DiskSpaceError::Insufficient {
            required,
            available,
        }
        .into());
    }

    let buffer = size.saturating_mul(2).max(config.safety_floor_bytes);
    if available - required < buffer {
        return Err(DiskSpaceError::Low {
            required,
            buffer,
            available,
        }
        .into());
    }

    Ok(())
}

/// At-rest protection applied to every file before it is linked into place.
pub trait FileProtection: Send + Sync {
    fn protect(&self, path: &Path) -> std::io::Result<()>;

    fn exclude_from_backup(&self, path: &Path) -> std::io::Result<()>;
}

/// Restricts files to the owning user. Backup exclusion is a no-op on
/// platforms without a per-file exclusion attribute.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerOnlyProtection;

impl FileProtection for OwnerOnlyProtection {
    #[cfg(unix)]
    fn protect(&self, path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
    }

    #[cfg(not(unix))]
    fn protect(&self, path: &Path) -> std::io::Result<()> {
        fs::metadata(path).map(|_| ())
    }

    fn exclude_from_backup(&self, path: &Path) -> std::io::Result<()> {
        debug!(path = %path.display(), "backup exclusion has no attribute on this platform");
        Ok(())
    }
}

pub(crate) fn apply_protection(protection: &dyn FileProtection, path: &Path) -> Result<()> {
    protection
        .protect(path)
        .map_err(|e| StoreError::fs("apply protection to", path, e))?;
    protection
        .exclude_from_backup(path)
        .map_err(|e| StoreError::fs("exclude from backup", path, e))
}

pub(crate) const TEMP_SUFFIX: &str = ".tmp";

/// Writes `bytes` to a temp file next to `target`, flushes it to stable
/// storage, protects it, then renames it over `target`. The temp file lives
/// in the same directory so the rename never crosses a volume.
pub(crate) fn atomic_replace(
    protection: &dyn FileProtection,
    target: &Path,
    bytes: &[u8],
) -> Result<()> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(|e| StoreError::fs("create temp file in", dir, e))?;

    tmp.write_all(bytes)
        .map_err(|e| StoreError::fs("write temp file", tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::fs("sync temp file", tmp.path(), e))?;
    apply_protection(protection, tmp.path())?;

    tmp.persist(target)
        .map_err(|e| StoreError::fs("rename temp file over", target, e.error))?;
    fsync_dir(dir);

    apply_protection(protection, target)
}

/// Makes a completed rename durable. Directories cannot be opened on every
/// platform, so failure is only logged.
pub(crate) fn fsync_dir(dir: &Path) {
    match File::open(dir).and_then(|d| d.sync_all()) {
        Ok(()) => {}
        Err(err) => debug!(dir = %dir.display(), error = %err, "directory fsync skipped"),
    }
}

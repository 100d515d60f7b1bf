//! On-disk layout of one dataset: the `main` file plus two rotated backup
//! generations, and the synchronous file operations that keep them
//! consistent.

use super::config::StoreConfig;
use super::fs_support::{
    DiskSpaceProbe, FileProtection, TEMP_SUFFIX, apply_protection, atomic_replace, ensure_capacity,
    fsync_dir,
};
use super::validator::{ContainerValidator, ValidationContext};
use crate::core::{Container, Record, Result, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const STAGING_SUFFIX: &str = ".new";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Generation {
    Main,
    Gen1,
    Gen2,
}

impl Generation {
    pub const ALL: [Generation; 3] = [Generation::Main, Generation::Gen1, Generation::Gen2];
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Main => "main",
            Self::Gen1 => "gen1",
            Self::Gen2 => "gen2",
        };
        write!(f, "{label}")
    }
}

/// Where a cascading load found its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    Generation(Generation),
    Empty,
}

/// Health of one generation file, as reported by [`GenerationFiles::inspect`].
#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub generation: Generation,
    pub path: PathBuf,
    pub exists: bool,
    pub record_count: Option<usize>,
    pub schema_version: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl GenerationReport {
    pub fn is_healthy(&self) -> bool {
        self.exists && self.error.is_none()
    }
}

#[derive(Clone)]
pub struct GenerationFiles {
    dir: PathBuf,
    stem: String,
    protection: Arc<dyn FileProtection>,
}

impl GenerationFiles {
    pub fn new(
        dir: impl Into<PathBuf>,
        stem: impl Into<String>,
        protection: Arc<dyn FileProtection>,
    ) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
            protection,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn path(&self, generation: Generation) -> PathBuf {
        match generation {
            Generation::Main => self.dir.join(format!("{}.json", self.stem)),
            Generation::Gen1 => self.dir.join(format!("{}.gen1.json", self.stem)),
            Generation::Gen2 => self.dir.join(format!("{}.gen2.json", self.stem)),
        }
    }

    fn staging_path(&self) -> PathBuf {
        self.dir.join(format!("{}.gen1.json{}", self.stem, STAGING_SUFFIX))
    }

    fn temp_prefix(&self) -> String {
        format!(".{}.", self.stem)
    }

    pub fn exists(&self, generation: Generation) -> bool {
        self.path(generation).exists()
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::fs("create directory", &self.dir, e))
    }

    /// Removes temp files and staged backups left behind by an interrupted
    /// write. Returns how many were removed.
    pub fn sweep_leftovers(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::fs("list directory", &self.dir, e)),
        };

        let prefix = self.temp_prefix();
        let staging = self.staging_path();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_temp = name.starts_with(&prefix) && name.ends_with(TEMP_SUFFIX);
            if is_temp || path == staging {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        removed += 1;
                        debug!(path = %path.display(), "removed leftover from interrupted write");
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove leftover file"),
                }
            }
        }
        Ok(removed)
    }

    fn read_raw<R: Record>(&self, generation: Generation) -> Result<(Container<R>, Vec<u8>)> {
        let path = self.path(generation);
        let bytes = fs::read(&path).map_err(|e| StoreError::fs("read", &path, e))?;
        let container = Container::from_bytes(&path, &bytes)?;
        Ok((container, bytes))
    }

    pub fn read_container<R: Record>(&self, generation: Generation) -> Result<Container<R>> {
        self.read_raw(generation).map(|(container, _)| container)
    }

    /// Tries `main`, then `gen1`, then `gen2`. Never fails: when nothing is
    /// readable an empty container is returned. A successful `gen1` read is
    /// copied back over `main` on a best-effort basis.
    pub fn load_cascading<R: Record>(&self, schema_version: &str) -> (Container<R>, LoadSource) {
        for generation in Generation::ALL {
            match self.read_raw::<R>(generation) {
                Ok((container, bytes)) => {
                    if generation == Generation::Gen1 {
                        self.repair_main(&bytes);
                    }
                    if generation != Generation::Main {
                        warn!(
                            dir = %self.dir.display(),
                            generation = %generation,
                            records = container.len(),
                            "recovered dataset from backup generation"
                        );
                    }
                    return (container, LoadSource::Generation(generation));
                }
                Err(StoreError::Filesystem { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    debug!(generation = %generation, "generation file not present");
                }
                Err(err) => {
                    warn!(generation = %generation, error = %err, "generation unreadable, trying next");
                }
            }
        }

        info!(dir = %self.dir.display(), "no readable generation, starting with an empty container");
        (Container::empty(schema_version), LoadSource::Empty)
    }

    fn repair_main(&self, bytes: &[u8]) {
        let main = self.path(Generation::Main);
        match self.write_atomic(&main, bytes) {
            Ok(()) => info!(path = %main.display(), "restored main from gen1"),
            Err(err) => warn!(path = %main.display(), error = %err, "could not restore main from gen1"),
        }
    }

    /// Atomically replaces `target`, which must live in this dataset's
    /// directory.
    pub fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        atomic_replace(self.protection.as_ref(), target, bytes)
    }

    /// Overwrites `target` in place and fsyncs it. A crash mid-write can tear
    /// the file; the backup generations cover that case on load.
    pub fn write_in_place(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(target)
            .map_err(|e| StoreError::fs("open", target, e))?;
        file.write_all(bytes)
            .map_err(|e| StoreError::fs("write", target, e))?;
        file.sync_all()
            .map_err(|e| StoreError::fs("sync", target, e))?;
        apply_protection(self.protection.as_ref(), target)
    }

    /// Copies `main` to a staged `gen1`, shifts `gen1` to `gen2`, then moves
    /// the staged copy into `gen1`. At every step at least one complete
    /// backup exists.
    pub fn rotate(&self) -> Result<()> {
        let main = self.path(Generation::Main);
        let gen1 = self.path(Generation::Gen1);
        let gen2 = self.path(Generation::Gen2);
        let staging = self.staging_path();

        fs::copy(&main, &staging).map_err(|e| StoreError::fs("copy main to", &staging, e))?;
        OpenOptions::new()
            .write(true)
            .open(&staging)
            .and_then(|f| f.sync_all())
            .map_err(|e| StoreError::fs("sync", &staging, e))?;
        apply_protection(self.protection.as_ref(), &staging)?;

        if gen1.exists() {
            if gen2.exists() {
                fs::remove_file(&gen2).map_err(|e| StoreError::fs("remove stale", &gen2, e))?;
            }
            fs::rename(&gen1, &gen2).map_err(|e| StoreError::fs("rename gen1 to", &gen2, e))?;
        }
        fs::rename(&staging, &gen1)
            .map_err(|e| StoreError::fs("rename staged backup to", &gen1, e))?;
        fsync_dir(&self.dir);
        Ok(())
    }

    /// Restores `main` from the newest readable backup. With no backup an
    /// empty container is written instead.
    pub fn rollback<R: Record>(&self, schema_version: &str) -> Result<LoadSource> {
        let main = self.path(Generation::Main);
        for generation in [Generation::Gen1, Generation::Gen2] {
            match self.read_raw::<R>(generation) {
                Ok((_, bytes)) => {
                    self.write_atomic(&main, &bytes)?;
                    warn!(path = %main.display(), from = %generation, "rolled main back to backup");
                    return Ok(LoadSource::Generation(generation));
                }
                Err(err) => debug!(generation = %generation, error = %err, "backup not usable for rollback"),
            }
        }

        let empty = Container::<R>::empty(schema_version);
        self.write_atomic(&main, &empty.to_bytes()?)?;
        error!(path = %main.display(), "no backup available, main reset to an empty container");
        Ok(LoadSource::Empty)
    }

    /// Runs the full save sequence: capacity check, write, read-back,
    /// validation, then backup rotation. A failed read-back or validation
    /// rolls `main` back before the error is returned.
    pub fn commit<R: Record>(
        &self,
        container: &Container<R>,
        config: &StoreConfig,
        probe: &dyn DiskSpaceProbe,
        validator: &ContainerValidator<R>,
    ) -> Result<Container<R>> {
        let bytes = container.to_bytes()?;
        let size = bytes.len() as u64;
        ensure_capacity(probe, &self.dir, size, config)?;

        let main = self.path(Generation::Main);
        if config.atomic_writes {
            self.write_atomic(&main, &bytes)?;
        } else {
            self.write_in_place(&main, &bytes)?;
        }

        let verified = self
            .read_container::<R>(Generation::Main)
            .and_then(|verified| {
                if verified == *container {
                    Ok(verified)
                } else {
                    Err(StoreError::Decoding {
                        path: main.clone(),
                        message: "read-back does not match the written container".to_string(),
                    })
                }
            })
            .and_then(|verified| {
                validator
                    .validate(&verified, &ValidationContext::new(size))
                    .map(|()| verified)
                    .map_err(StoreError::from)
            });

        let verified = match verified {
            Ok(verified) => verified,
            Err(err) => {
                warn!(path = %main.display(), error = %err, "verification failed after write, rolling back");
                if let Err(rollback_err) = self.rollback::<R>(&config.schema_version) {
                    error!(error = %rollback_err, "rollback failed");
                }
                return Err(err);
            }
        };

        self.rotate()?;
        debug!(path = %main.display(), bytes = size, records = verified.len(), "container committed");
        Ok(verified)
    }

    pub fn inspect<R: Record>(&self) -> Vec<GenerationReport> {
        Generation::ALL
            .into_iter()
            .map(|generation| {
                let path = self.path(generation);
                let exists = path.exists();
                let mut report = GenerationReport {
                    generation,
                    path,
                    exists,
                    record_count: None,
                    schema_version: None,
                    last_updated: None,
                    error: None,
                };
                if exists {
                    match self.read_container::<R>(generation) {
                        Ok(container) => {
                            report.record_count = Some(container.len());
                            report.schema_version = Some(container.schema_version);
                            report.last_updated = Some(container.last_updated);
                        }
                        Err(err) => report.error = Some(err.to_string()),
                    }
                }
                report
            })
            .collect()
    }

    pub fn remove_all(&self) -> Result<()> {
        for path in Generation::ALL
            .into_iter()
            .map(|g| self.path(g))
            .chain(std::iter::once(self.staging_path()))
        {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::fs("remove", &path, e)),
            }
        }
        Ok(())
    }
}

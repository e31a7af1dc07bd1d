//! Shared, lock-guarded node directories.
//!
//! Every session process on a node shares three directories: the file cache,
//! the package area and the query-results area. Each is owned by exactly one
//! [`LockGuard`]; no code path locks two areas at once.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::GlobalConfig;
use crate::lock::LockGuard;
use crate::{AppError, Result};

/// Which shared directory an area guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaKind {
    /// Cached input files.
    Cache,
    /// Package archives and unpacked packages.
    Packages,
    /// Persisted query records.
    Queries,
}

impl AreaKind {
    fn lock_prefix(self) -> &'static str {
        match self {
            Self::Cache => "node-cache-lock-",
            Self::Packages => "node-package-lock-",
            Self::Queries => "node-query-lock-",
        }
    }
}

impl fmt::Display for AreaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cache => f.write_str("cache"),
            Self::Packages => f.write_str("packages"),
            Self::Queries => f.write_str("queries"),
        }
    }
}

/// One shared directory plus its lock.
#[derive(Debug)]
pub struct ResourceArea {
    kind: AreaKind,
    dir: PathBuf,
    guard: LockGuard,
    timeout: Duration,
}

/// Scoped hold on a [`ResourceArea`]; the lock is released on drop.
#[derive(Debug)]
pub struct AreaLock<'a> {
    guard: &'a mut LockGuard,
}

impl Drop for AreaLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.guard.release() {
            warn!(path = %self.guard.path().display(), %err, "failed to release area lock");
        }
    }
}

impl ResourceArea {
    /// Create the directory if needed and bind a lock to it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub fn open(kind: AreaKind, dir: PathBuf, lock_dir: &Path, timeout: Duration) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::Io(format!("cannot create {kind} area {}: {err}", dir.display()))
        })?;
        let guard = LockGuard::for_path(lock_dir, kind.lock_prefix(), &dir);
        Ok(Self {
            kind,
            dir,
            guard,
            timeout,
        })
    }

    /// Which area this is.
    #[must_use]
    pub fn kind(&self) -> AreaKind {
        self.kind
    }

    /// The guarded directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lock the area for the lifetime of the returned value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` if the lock cannot be obtained within the
    /// configured timeout.
    pub async fn lock(&mut self) -> Result<AreaLock<'_>> {
        self.guard.acquire_timeout(self.timeout).await?;
        debug!(area = %self.kind, "area locked");
        Ok(AreaLock {
            guard: &mut self.guard,
        })
    }
}

/// The three shared areas of a node.
#[derive(Debug)]
pub struct ResourceAreas {
    /// File cache.
    pub cache: ResourceArea,
    /// Package area.
    pub packages: ResourceArea,
    /// Query-results area.
    pub queries: ResourceArea,
}

impl ResourceAreas {
    /// Open all areas below the configured work directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if any directory cannot be created.
    pub fn open(config: &GlobalConfig) -> Result<Self> {
        let timeout = config.lock_timeout();
        Ok(Self {
            cache: ResourceArea::open(AreaKind::Cache, config.cache_dir(), &config.lock_dir, timeout)?,
            packages: ResourceArea::open(
                AreaKind::Packages,
                config.package_dir(),
                &config.lock_dir,
                timeout,
            )?,
            queries: ResourceArea::open(AreaKind::Queries, config.query_dir(), &config.lock_dir, timeout)?,
        })
    }
}

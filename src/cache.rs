//! Shared file cache.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::areas::ResourceArea;
use crate::fs_ops::{clear_dir, same_contents};
use crate::{AppError, Result};

/// One cached file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CacheEntry {
    /// File name inside the cache.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// Result of [`FileCache::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheAdd {
    /// The file was copied into the cache.
    Copied(PathBuf),
    /// An identical file was already cached.
    Unchanged(PathBuf),
}

/// The cache area of the node.
#[derive(Debug)]
pub struct FileCache {
    area: ResourceArea,
}

impl FileCache {
    /// Wrap the cache area.
    #[must_use]
    pub fn new(area: ResourceArea) -> Self {
        Self { area }
    }

    /// The cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.area.dir()
    }

    /// List cached files, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` or `AppError::Io`.
    pub async fn list(&mut self) -> Result<Vec<CacheEntry>> {
        let root = self.area.dir().to_path_buf();
        let _area = self.area.lock().await?;
        let mut out = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                out.push(CacheEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: meta.len(),
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Empty the cache; returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` or `AppError::Io`.
    pub async fn clear(&mut self) -> Result<usize> {
        let root = self.area.dir().to_path_buf();
        let _area = self.area.lock().await?;
        let removed = clear_dir(&root)?;
        info!(removed, "cache cleared");
        Ok(removed)
    }

    /// Copy `source` into the cache under its file name.
    ///
    /// A cached file with the same size and checksum is kept as is.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `source` is not a file, or
    /// `AppError::Lock` or `AppError::Io`.
    pub async fn add(&mut self, source: &Path) -> Result<CacheAdd> {
        if !source.is_file() {
            return Err(AppError::NotFound(format!("file {}", source.display())));
        }
        let name = source
            .file_name()
            .ok_or_else(|| AppError::Io(format!("{} has no file name", source.display())))?;
        let target = self.area.dir().join(name);
        let _area = self.area.lock().await?;
        if same_contents(source, &target)? {
            debug!(file = %target.display(), "cached copy is up to date");
            return Ok(CacheAdd::Unchanged(target));
        }
        fs::copy(source, &target)?;
        Ok(CacheAdd::Copied(target))
    }
}

//! Direct filesystem helpers shared by the stores.

use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::{AppError, Result};

/// Remove a directory tree by renaming it to a hidden sibling first and
/// deleting the renamed copy.
///
/// Readers never observe a half-deleted directory under the original name.
/// Missing directories are not an error.
///
/// # Errors
///
/// Returns `AppError::Io` if the rename or the removal fails.
pub fn remove_dir_atomic(dir: &Path) -> Result<()> {
    let Some(parent) = dir.parent() else {
        return Err(AppError::Io(format!("refusing to remove {}", dir.display())));
    };
    let doomed = parent.join(format!(".delete-{}", uuid::Uuid::new_v4()));
    match fs::rename(dir, &doomed) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(AppError::Io(format!(
                "cannot move {} aside: {err}",
                dir.display()
            )))
        }
    }
    fs::remove_dir_all(&doomed)
        .map_err(|err| AppError::Io(format!("cannot remove {}: {err}", doomed.display())))
}

/// Remove every entry inside `dir`, keeping `dir` itself.
///
/// # Errors
///
/// Returns `AppError::Io` on the first entry that cannot be removed.
pub fn clear_dir(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(AppError::Io(format!("cannot list {}: {err}", dir.display()))),
    };
    let entries = entries.collect::<std::io::Result<Vec<_>>>()?;
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            remove_dir_atomic(&path)?;
        } else {
            fs::remove_file(&path)
                .map_err(|err| AppError::Io(format!("cannot remove {}: {err}", path.display())))?;
        }
        removed += 1;
    }
    Ok(removed)
}

/// Write `contents` to `path` through a temporary file in the same
/// directory, so readers see either the old or the new content.
///
/// # Errors
///
/// Returns `AppError::Io` if the temporary file cannot be written or renamed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Io(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|err| AppError::Io(format!("cannot persist {}: {err}", path.display())))?;
    Ok(())
}

/// Whether `dir` exists and has no entries.
#[must_use]
pub fn is_empty_dir(dir: &Path) -> bool {
    fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_none())
}

/// SHA-256 of a file, lower-case hex.
///
/// # Errors
///
/// Returns `AppError::Io` if the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|err| AppError::Io(format!("cannot open {}: {err}", path.display())))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether `target` exists with the same size and checksum as `source`.
///
/// # Errors
///
/// Returns `AppError::Io` if either file cannot be read.
pub fn same_contents(source: &Path, target: &Path) -> Result<bool> {
    let Ok(existing) = fs::metadata(target) else {
        return Ok(false);
    };
    if !existing.is_file() || existing.len() != fs::metadata(source)?.len() {
        return Ok(false);
    }
    Ok(sha256_file(source)? == sha256_file(target)?)
}

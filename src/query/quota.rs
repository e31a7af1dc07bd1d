//! Cross-session retention reconciliation.
//!
//! Runs on the coordinator after each save and at setup. Records of other
//! sessions are inventoried by modification time; everything beyond the
//! newest `max_kept` is deleted, and session directories left empty are
//! removed. Unreadable records are deleted outright.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use super::store::RECORD_FILE;
use crate::fs_ops::{is_empty_dir, remove_dir_atomic};
use crate::session::model::SessionTag;
use crate::Result;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaReport {
    /// Records found outside the current session.
    pub inspected: usize,
    /// Record directories deleted.
    pub removed: Vec<PathBuf>,
    /// Session directories deleted because they became empty.
    pub removed_sessions: Vec<PathBuf>,
}

/// Enforce `max_kept` over every record under `root` not owned by `own`.
///
/// A negative `max_kept` disables eviction.
///
/// # Errors
///
/// Returns `AppError::Io` if the results root cannot be listed or a record
/// directory cannot be removed.
pub fn reconcile(root: &Path, own: &SessionTag, max_kept: i64) -> Result<QuotaReport> {
    let mut report = QuotaReport::default();
    let Ok(limit) = usize::try_from(max_kept) else {
        return Ok(report);
    };

    let own_dir = own.dir_name();
    let mut inventory: Vec<(SystemTime, PathBuf)> = Vec::new();
    let mut session_dirs: Vec<PathBuf> = Vec::new();

    for session_dir in fs::read_dir(root)? {
        let session_dir = session_dir?;
        let name = session_dir.file_name().to_string_lossy().into_owned();
        if !name.starts_with("session-") || name == own_dir || !session_dir.file_type()?.is_dir() {
            continue;
        }
        session_dirs.push(session_dir.path());

        for record_dir in fs::read_dir(session_dir.path())? {
            let record_dir = record_dir?;
            if record_dir.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let path = record_dir.path();
            match fs::metadata(path.join(RECORD_FILE)).and_then(|m| m.modified()) {
                Ok(mtime) => inventory.push((mtime, path)),
                Err(err) => {
                    warn!(dir = %path.display(), %err, "removing unreadable query record");
                    remove_record_dir(&path)?;
                    report.removed.push(path);
                }
            }
        }
    }

    report.inspected = inventory.len() + report.removed.len();
    inventory.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in inventory.into_iter().skip(limit) {
        debug!(dir = %path.display(), "evicting query record over quota");
        remove_record_dir(&path)?;
        report.removed.push(path);
    }

    for dir in session_dirs {
        if is_empty_dir(&dir) {
            fs::remove_dir(&dir)?;
            report.removed_sessions.push(dir);
        }
    }

    if !report.removed.is_empty() {
        info!(
            removed = report.removed.len(),
            sessions = report.removed_sessions.len(),
            max_kept,
            "query quota reconciled"
        );
    }
    Ok(report)
}

fn remove_record_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        remove_dir_atomic(path)
    } else {
        fs::remove_file(path).map_err(Into::into)
    }
}

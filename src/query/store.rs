//! On-disk and in-memory record of a session's queries.
//!
//! Layout: `<queries>/session-<tag>/<seq>/query-result.json`. Each session
//! holds a lock on its own results for its whole lifetime; other sessions
//! probe that lock without blocking before touching the directory, so a
//! successful probe doubles as proof that the owner is gone.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use super::descriptor::{QueryDescriptor, QueryStatus, QuerySummary};
use super::quota::{self, QuotaReport};
use super::reference::QueryRef;
use crate::areas::ResourceArea;
use crate::fs_ops::{is_empty_dir, remove_dir_atomic, write_atomic};
use crate::lock::LockGuard;
use crate::session::model::SessionTag;
use crate::{AppError, Result};

/// File name of a persisted query record.
pub const RECORD_FILE: &str = "query-result.json";

/// Message sent upstream when nothing can be evicted to make room.
pub const QUOTA_EXCEEDED_MESSAGE: &str = "Too many saved queries";

/// The lock a session holds over its own query results.
#[must_use]
pub fn session_lock(lock_dir: &Path, tag: &SessionTag, results_root: &Path) -> LockGuard {
    LockGuard::for_path(lock_dir, &format!("session-lock-{tag}-"), results_root)
}

/// Result of [`QueryStore::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Written to disk; lists queries evicted to make room.
    Saved {
        /// Sequence numbers evicted from this session.
        evicted: Vec<u64>,
    },
    /// Disposable query, not persisted.
    Skipped,
    /// The retention quota could not be met; kept in memory only.
    QuotaExceeded,
}

#[derive(Debug, Clone)]
struct Entry {
    descriptor: QueryDescriptor,
    stored: bool,
}

/// Query records of the current session plus those scanned from others.
#[derive(Debug)]
pub struct QueryStore {
    area: ResourceArea,
    lock_dir: PathBuf,
    tag: SessionTag,
    own_lock: LockGuard,
    max_kept: i64,
    archive_dir: Option<PathBuf>,
    current: Vec<Entry>,
    previous: Vec<QueryDescriptor>,
}

impl QueryStore {
    /// Open the store and take the session's own results lock.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` if another live process already holds the
    /// lock for `tag`, or `AppError::Io` if the directory cannot be created.
    pub fn open(
        area: ResourceArea,
        lock_dir: &Path,
        tag: SessionTag,
        max_kept: i64,
        archive_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let mut own_lock = session_lock(lock_dir, &tag, area.dir());
        if !own_lock.try_acquire()? {
            return Err(AppError::Lock(format!(
                "query results of session {tag} are locked by another process"
            )));
        }
        fs::create_dir_all(area.dir().join(tag.dir_name()))?;
        Ok(Self {
            area,
            lock_dir: lock_dir.to_path_buf(),
            tag,
            own_lock,
            max_kept,
            archive_dir,
            current: Vec::new(),
            previous: Vec::new(),
        })
    }

    /// Tag of the owning session.
    #[must_use]
    pub fn tag(&self) -> &SessionTag {
        &self.tag
    }

    /// Root of the shared results area.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.area.dir()
    }

    /// Retention quota; `-1` is unlimited.
    #[must_use]
    pub fn max_kept(&self) -> i64 {
        self.max_kept
    }

    /// Default archive directory.
    #[must_use]
    pub fn archive_dir(&self) -> Option<&Path> {
        self.archive_dir.as_deref()
    }

    /// Replace the default archive directory.
    pub fn set_archive_dir(&mut self, dir: PathBuf) {
        info!(dir = %dir.display(), "default archive directory set");
        self.archive_dir = Some(dir);
    }

    /// Directory holding the record of `seq` in session `tag`.
    #[must_use]
    pub fn record_dir(&self, tag: &SessionTag, seq: u64) -> PathBuf {
        self.area.dir().join(tag.dir_name()).join(seq.to_string())
    }

    /// Results directory of session `tag`, refused unless it is a direct
    /// child of the results area.
    fn session_dir(&self, tag: &SessionTag) -> Result<PathBuf> {
        let name = tag.dir_name();
        let mut parts = Path::new(&name).components();
        match (parts.next(), parts.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.area.dir().join(name)),
            _ => Err(AppError::Query(format!(
                "session tag {tag} does not name a results directory"
            ))),
        }
    }

    /// Number of this session's records present on disk.
    #[must_use]
    pub fn stored_count(&self) -> usize {
        self.current.iter().filter(|e| e.stored).count()
    }

    /// Descriptors of this session, oldest first.
    pub fn current(&self) -> impl Iterator<Item = &QueryDescriptor> {
        self.current.iter().map(|e| &e.descriptor)
    }

    /// Listing of this session's queries, optionally followed by queries of
    /// previous sessions found by [`QueryStore::scan_previous`].
    #[must_use]
    pub fn summaries(&self, include_previous: bool) -> Vec<QuerySummary> {
        let mut out: Vec<QuerySummary> = Vec::new();
        if include_previous {
            out.extend(self.previous.iter().map(|d| d.summary(true)));
        }
        out.extend(self.current.iter().map(|e| e.descriptor.summary(e.stored)));
        out
    }

    /// Persist a finished descriptor, evicting older records of this session
    /// when the retention quota requires it.
    ///
    /// Eviction picks the least recently finished archived record first; its
    /// directory is deleted but its summary stays listable. Without an
    /// archived candidate the least recently finished record is dropped
    /// entirely.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Query` for an unfinished or aborted descriptor, or
    /// `AppError::Io` if the record cannot be written.
    pub fn save(&mut self, descriptor: QueryDescriptor) -> Result<SaveOutcome> {
        if !descriptor.status.is_finished() || descriptor.status == QueryStatus::Aborted {
            return Err(AppError::Query(format!(
                "query {} is {:?} and cannot be saved",
                descriptor.seq, descriptor.status
            )));
        }
        if descriptor.draw {
            return Ok(SaveOutcome::Skipped);
        }

        let Some(evicted) = self.make_room()? else {
            warn!(seq = descriptor.seq, max_kept = self.max_kept, "query record not saved: quota full");
            self.current.push(Entry {
                descriptor,
                stored: false,
            });
            return Ok(SaveOutcome::QuotaExceeded);
        };

        self.write_record(&descriptor)?;
        debug!(seq = descriptor.seq, "query record saved");
        self.current.retain(|e| e.descriptor.seq != descriptor.seq);
        self.current.push(Entry {
            descriptor,
            stored: true,
        });
        Ok(SaveOutcome::Saved { evicted })
    }

    fn make_room(&mut self) -> Result<Option<Vec<u64>>> {
        let mut evicted = Vec::new();
        let Ok(limit) = usize::try_from(self.max_kept) else {
            return Ok(Some(evicted));
        };

        while self.stored_count() >= limit {
            let archived = self
                .current
                .iter()
                .enumerate()
                .filter(|(_, e)| e.stored && e.descriptor.archive_path.is_some())
                .min_by_key(|(_, e)| (e.descriptor.finished_at, e.descriptor.seq))
                .map(|(idx, _)| idx);
            if let Some(idx) = archived {
                let seq = self.current[idx].descriptor.seq;
                remove_dir_atomic(&self.record_dir(&self.tag, seq))?;
                let entry = &mut self.current[idx];
                entry.stored = false;
                entry.descriptor.output.clear();
                entry.descriptor.log_lines.clear();
                evicted.push(seq);
                continue;
            }

            let oldest = self
                .current
                .iter()
                .enumerate()
                .filter(|(_, e)| e.stored)
                .min_by_key(|(_, e)| (e.descriptor.finished_at, e.descriptor.seq))
                .map(|(idx, _)| idx);
            let Some(idx) = oldest else {
                return Ok(None);
            };
            let seq = self.current[idx].descriptor.seq;
            remove_dir_atomic(&self.record_dir(&self.tag, seq))?;
            self.current.remove(idx);
            evicted.push(seq);
        }
        Ok(Some(evicted))
    }

    fn write_record(&self, descriptor: &QueryDescriptor) -> Result<()> {
        let dir = self
            .session_dir(&descriptor.session_tag)?
            .join(descriptor.seq.to_string());
        let raw = serde_json::to_vec_pretty(descriptor)
            .map_err(|err| AppError::Query(format!("cannot encode query record: {err}")))?;
        write_atomic(&dir.join(RECORD_FILE), &raw)
    }

    /// Resolve a reference to its descriptor and record directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no matching record exists.
    pub fn locate(&self, reference: &QueryRef) -> Result<(QueryDescriptor, PathBuf)> {
        let owner = reference.owner(&self.tag);
        let seq = reference.seq();
        if owner == &self.tag {
            let entry = self
                .current
                .iter()
                .find(|e| e.descriptor.seq == seq)
                .ok_or_else(|| AppError::NotFound(format!("query {reference}")))?;
            return Ok((entry.descriptor.clone(), self.record_dir(&self.tag, seq)));
        }
        let dir = self.session_dir(owner)?.join(seq.to_string());
        let descriptor = load_record(&dir.join(RECORD_FILE))?;
        Ok((descriptor, dir))
    }

    /// Load the full record behind a reference.
    ///
    /// Records of other sessions are only read after their owner has been
    /// shown to be gone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` ("could not lock session") while the owner is
    /// alive, or `AppError::NotFound` if no record exists.
    pub fn retrieve(&self, reference: &QueryRef) -> Result<QueryDescriptor> {
        let _owner_lock = self.lock_session(reference.owner(&self.tag))?;
        let (descriptor, dir) = self.locate(reference)?;
        if reference.is_local_to(&self.tag) {
            let stored = self
                .current
                .iter()
                .any(|e| e.descriptor.seq == descriptor.seq && e.stored);
            if !stored {
                return Ok(descriptor);
            }
        }
        load_record(&dir.join(RECORD_FILE))
    }

    /// Delete the record behind a reference.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` ("could not lock session") while the owner of
    /// a foreign record is alive, or `AppError::NotFound` if no record exists.
    pub fn remove(&mut self, reference: &QueryRef) -> Result<()> {
        let owner = reference.owner(&self.tag).clone();
        let seq = reference.seq();
        if owner == self.tag {
            let idx = self
                .current
                .iter()
                .position(|e| e.descriptor.seq == seq)
                .ok_or_else(|| AppError::NotFound(format!("query {reference}")))?;
            if self.current[idx].stored {
                remove_dir_atomic(&self.record_dir(&self.tag, seq))?;
            }
            self.current.remove(idx);
            info!(seq, "query removed");
            return Ok(());
        }

        let session_dir = self.session_dir(&owner)?;
        let owner_lock = self.lock_session(&owner)?;
        let dir = session_dir.join(seq.to_string());
        if !dir.exists() {
            return Err(AppError::NotFound(format!("query {reference}")));
        }
        remove_dir_atomic(&dir)?;
        if is_empty_dir(&session_dir) {
            fs::remove_dir(&session_dir)?;
            if let Some(guard) = owner_lock {
                guard.release_and_remove()?;
            }
        }
        self.previous
            .retain(|d| !(d.session_tag == owner && d.seq == seq));
        info!(session = %owner, seq, "foreign query removed");
        Ok(())
    }

    /// Copy the record behind a reference to an archive location.
    ///
    /// `path` may name a directory (the record lands in
    /// `<dir>/session-<tag>-<seq>.json`) or a file. When empty, the default
    /// archive directory is used.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Query` if no destination is known, plus the errors
    /// of [`QueryStore::retrieve`].
    pub fn archive(&mut self, reference: &QueryRef, path: &str) -> Result<PathBuf> {
        let mut descriptor = self.retrieve(reference)?;
        let target = self.archive_target(&descriptor, path)?;
        descriptor.archive_path = Some(target.clone());
        let raw = serde_json::to_vec_pretty(&descriptor)
            .map_err(|err| AppError::Query(format!("cannot encode query record: {err}")))?;
        write_atomic(&target, &raw)?;

        if reference.is_local_to(&self.tag) {
            let seq = descriptor.seq;
            let stored = if let Some(entry) = self.current.iter_mut().find(|e| e.descriptor.seq == seq) {
                entry.descriptor.archive_path = Some(target.clone());
                entry.stored
            } else {
                false
            };
            if stored {
                self.write_record(&descriptor)?;
            }
        } else {
            let _owner_lock = self.lock_session(&descriptor.session_tag)?;
            self.write_record(&descriptor)?;
        }
        info!(reference = %reference, target = %target.display(), "query archived");
        Ok(target)
    }

    fn archive_target(&self, descriptor: &QueryDescriptor, path: &str) -> Result<PathBuf> {
        let file_name = format!("session-{}-{}.json", descriptor.session_tag, descriptor.seq);
        let path = path.trim();
        if path.is_empty() {
            return self
                .archive_dir
                .as_ref()
                .map(|dir| dir.join(&file_name))
                .ok_or_else(|| AppError::Query("no archive path specified".into()));
        }
        let explicit = PathBuf::from(path);
        if explicit.is_dir() || path.ends_with('/') {
            Ok(explicit.join(file_name))
        } else {
            Ok(explicit)
        }
    }

    /// Load the records of other sessions for listing.
    ///
    /// Unfinished records whose owner is gone are deleted on the way.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the results area cannot be listed.
    pub fn scan_previous(&mut self) -> Result<usize> {
        let mut found: Vec<QueryDescriptor> = Vec::new();
        for (tag, session_dir) in self.other_sessions()? {
            for record_dir in fs::read_dir(&session_dir)? {
                let record_dir = record_dir?.path();
                let Ok(descriptor) = load_record(&record_dir.join(RECORD_FILE)) else {
                    continue;
                };
                if descriptor.status.is_finished() {
                    found.push(descriptor);
                    continue;
                }
                match self.lock_session(&tag) {
                    Ok(_dead_owner) => {
                        warn!(dir = %record_dir.display(), "removing unfinished record of dead session");
                        remove_dir_atomic(&record_dir)?;
                    }
                    Err(_) => found.push(descriptor),
                }
            }
        }
        found.sort_by(|a, b| {
            a.finished_at
                .cmp(&b.finished_at)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        self.previous = found;
        Ok(self.previous.len())
    }

    /// Remove the whole results directory of a dead session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Query` for the current session, `AppError::Lock`
    /// while the owner is alive, or `AppError::NotFound` if nothing exists.
    pub fn cleanup_session(&mut self, tag: &SessionTag) -> Result<()> {
        if tag == &self.tag {
            return Err(AppError::Query("cannot clean up the current session".into()));
        }
        let dir = self.session_dir(tag)?;
        let owner_lock = self.lock_session(tag)?;
        if !dir.exists() {
            return Err(AppError::NotFound(format!("session {tag}")));
        }
        remove_dir_atomic(&dir)?;
        if let Some(guard) = owner_lock {
            guard.release_and_remove()?;
        }
        self.previous.retain(|d| &d.session_tag != tag);
        info!(session = %tag, "session results removed");
        Ok(())
    }

    /// Remove the results directories of every dead session.
    ///
    /// Live sessions are skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the results area cannot be listed.
    pub fn cleanup_dirs(&mut self) -> Result<usize> {
        let mut removed = 0;
        for (tag, _) in self.other_sessions()? {
            match self.cleanup_session(&tag) {
                Ok(()) => removed += 1,
                Err(AppError::Lock(_)) => debug!(session = %tag, "skipping live session"),
                Err(err) => warn!(session = %tag, %err, "cannot clean up session"),
            }
        }
        Ok(removed)
    }

    /// Enforce the retention quota over other sessions' records under the
    /// results area lock.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` if the area cannot be locked, or the errors
    /// of [`quota::reconcile`].
    pub async fn apply_quota(&mut self) -> Result<QuotaReport> {
        let root = self.area.dir().to_path_buf();
        let _area = self.area.lock().await?;
        quota::reconcile(&root, &self.tag, self.max_kept)
    }

    /// Whether the current session still holds its own results lock.
    #[must_use]
    pub fn holds_session_lock(&self) -> bool {
        self.own_lock.is_held()
    }

    /// Release the session's own results lock.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` if unlocking fails.
    pub fn close(&mut self) -> Result<()> {
        self.own_lock.release()
    }

    fn lock_session(&self, tag: &SessionTag) -> Result<Option<LockGuard>> {
        if tag == &self.tag {
            return Ok(None);
        }
        let mut guard = session_lock(&self.lock_dir, tag, self.area.dir());
        if guard.try_acquire()? {
            Ok(Some(guard))
        } else {
            Err(AppError::Lock(format!(
                "could not lock session {tag}: its owner is still running"
            )))
        }
    }

    fn other_sessions(&self) -> Result<Vec<(SessionTag, PathBuf)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.area.dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("session-") || !entry.file_type()?.is_dir() {
                continue;
            }
            match SessionTag::parse(&name) {
                Ok(tag) if tag != self.tag => out.push((tag, entry.path())),
                Ok(_) => {}
                Err(_) => debug!(dir = %name, "ignoring malformed session directory"),
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Read one persisted record.
///
/// # Errors
///
/// Returns `AppError::NotFound` if the file is missing, or `AppError::Query`
/// if it cannot be decoded.
pub fn load_record(path: &Path) -> Result<QueryDescriptor> {
    let raw = fs::read(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound(format!("query record {}", path.display()))
        } else {
            AppError::Io(format!("cannot read {}: {err}", path.display()))
        }
    })?;
    serde_json::from_slice(&raw)
        .map_err(|err| AppError::Query(format!("corrupt query record {}: {err}", path.display())))
}

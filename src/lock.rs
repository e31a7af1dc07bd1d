//! Advisory cross-process lock bound to one filesystem path.
//!
//! A [`LockGuard`] owns a lock file in the node's lock directory. The file
//! name is derived from the guarded path so that every process on the node
//! computes the same name independently. Locking is advisory and uses
//! `flock`-style exclusive locks through [`fs2`], so a lock held by a process
//! that dies is released by the kernel.
//!
//! Owner metadata (`pid`, acquisition time) is written next to the lock file
//! as `<lock>.owner.json` for diagnostics and liveness checks.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{AppError, Result};

const POLL_BASE_MS: u64 = 25;
const POLL_MAX_MS: u64 = 400;
const RELINK_ATTEMPTS: usize = 3;

/// Owner metadata stored alongside a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    /// Process id of the holder.
    pub pid: u32,
    /// When the holder acquired the lock.
    pub acquired_at: DateTime<Utc>,
}

/// Named advisory lock over one lock file.
///
/// Not reentrant: acquiring a guard that is already held returns
/// [`AppError::Lock`] instead of deadlocking.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    owner_path: PathBuf,
    file: Option<File>,
}

/// Derive the lock file name for `guarded`: `prefix` followed by the path
/// with every `/` replaced by `%`.
#[must_use]
pub fn lock_file_name(prefix: &str, guarded: &Path) -> String {
    let flat = guarded.to_string_lossy().replace(['/', '\\'], "%");
    format!("{prefix}{flat}")
}

impl LockGuard {
    /// Create an unheld guard over an explicit lock file path.
    #[must_use]
    pub fn new(lock_path: PathBuf) -> Self {
        let owner_path = {
            let name = lock_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            lock_path.with_file_name(format!("{name}.owner.json"))
        };
        Self {
            lock_path,
            owner_path,
            file: None,
        }
    }

    /// Create an unheld guard for `guarded`, placing the lock file in
    /// `lock_dir`.
    #[must_use]
    pub fn for_path(lock_dir: &Path, prefix: &str, guarded: &Path) -> Self {
        Self::new(lock_dir.join(lock_file_name(prefix, guarded)))
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Whether this guard currently holds the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Block until the lock is obtained.
    ///
    /// Blocks the calling thread; async code uses
    /// [`LockGuard::acquire_timeout`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` if the guard is already held or the lock file
    /// cannot be opened or locked.
    pub fn acquire(&mut self) -> Result<()> {
        loop {
            let file = self.open_unheld()?;
            file.lock_exclusive().map_err(|err| {
                AppError::Lock(format!("cannot lock {}: {err}", self.lock_path.display()))
            })?;
            if self.still_linked(&file) {
                self.install(file);
                return Ok(());
            }
            debug!(path = %self.lock_path.display(), "lock file replaced while waiting, retrying");
        }
    }

    /// Try to obtain the lock without blocking.
    ///
    /// Returns `Ok(false)` when another holder has it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` if the guard is already held or the lock file
    /// cannot be opened.
    pub fn try_acquire(&mut self) -> Result<bool> {
        for _ in 0..RELINK_ATTEMPTS {
            let file = self.open_unheld()?;
            match file.try_lock_exclusive() {
                Ok(()) if self.still_linked(&file) => {
                    self.install(file);
                    return Ok(true);
                }
                Ok(()) => {}
                Err(err) if is_contended(&err) => return Ok(false),
                Err(err) => {
                    return Err(AppError::Lock(format!(
                        "cannot lock {}: {err}",
                        self.lock_path.display()
                    )))
                }
            }
        }
        Ok(false)
    }

    /// Poll for the lock until `timeout` expires.
    ///
    /// Backs off exponentially with jitter between attempts, yielding to the
    /// runtime while it waits.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` on timeout, naming the current holder when its
    /// metadata is readable.
    pub async fn acquire_timeout(&mut self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if self.try_acquire()? {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                let holder = match self.holder() {
                    Some(owner) => format!(
                        "held by pid {} since {} ({})",
                        owner.pid,
                        owner.acquired_at.to_rfc3339(),
                        if pid_alive(owner.pid) { "alive" } else { "dead" }
                    ),
                    None => "holder unknown".into(),
                };
                return Err(AppError::Lock(format!(
                    "timed out after {:?} waiting for {}: {holder}",
                    timeout,
                    self.lock_path.display()
                )));
            }
            let base = (POLL_BASE_MS << attempt.min(4)).min(POLL_MAX_MS);
            let sleep = base + jitter_ms(base / 2 + 1);
            let remaining = timeout.saturating_sub(start.elapsed());
            let pause = Duration::from_millis(sleep).min(remaining.max(Duration::from_millis(1)));
            tokio::time::sleep(pause).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Release the lock if held. Releasing an unheld guard is a no-op.
    ///
    /// The lock file itself is left in place for the next acquirer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` if unlocking fails.
    pub fn release(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let _ = fs::remove_file(&self.owner_path);
        FileExt::unlock(&file).map_err(|err| {
            AppError::Lock(format!("cannot unlock {}: {err}", self.lock_path.display()))
        })
    }

    /// Read the owner metadata of the current holder, if any.
    #[must_use]
    pub fn holder(&self) -> Option<LockOwner> {
        fs::read_to_string(&self.owner_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    /// Whether the recorded holder process is still running.
    ///
    /// Returns `false` when no metadata is recorded.
    #[must_use]
    pub fn holder_alive(&self) -> bool {
        self.holder().is_some_and(|owner| pid_alive(owner.pid))
    }

    /// Release the lock and unlink the lock file.
    ///
    /// Only for resources that are being removed for good, e.g. the query
    /// directory of a finished session. A process that was already waiting
    /// on the unlinked file notices the replacement when it gets the lock and
    /// retries on the path, so holders never coexist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` if unlocking fails.
    pub fn release_and_remove(mut self) -> Result<()> {
        // Unlink while still holding so a waiter never sees the old file as
        // current.
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(AppError::Lock(format!(
                    "cannot remove lock file {}: {err}",
                    self.lock_path.display()
                )))
            }
        }
        self.release()
    }

    fn open_unheld(&self) -> Result<File> {
        if self.file.is_some() {
            return Err(AppError::Lock(format!(
                "{} is already held by this guard",
                self.lock_path.display()
            )));
        }
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::Lock(format!("cannot create lock dir {}: {err}", parent.display()))
            })?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|err| {
                AppError::Lock(format!("cannot open {}: {err}", self.lock_path.display()))
            })
    }

    /// Whether `file` is still the lock file linked at the lock path.
    #[cfg(unix)]
    fn still_linked(&self, file: &File) -> bool {
        use std::os::unix::fs::MetadataExt;

        match (file.metadata(), fs::metadata(&self.lock_path)) {
            (Ok(held), Ok(linked)) => held.dev() == linked.dev() && held.ino() == linked.ino(),
            _ => false,
        }
    }

    #[cfg(not(unix))]
    fn still_linked(&self, _file: &File) -> bool {
        self.lock_path.exists()
    }

    fn install(&mut self, file: File) {
        let owner = LockOwner {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        match serde_json::to_string(&owner) {
            Ok(raw) => {
                if let Err(err) = fs::write(&self.owner_path, raw) {
                    warn!(path = %self.owner_path.display(), %err, "failed to write lock owner metadata");
                }
            }
            Err(err) => warn!(%err, "failed to serialize lock owner metadata"),
        }
        debug!(path = %self.lock_path.display(), "lock acquired");
        self.file = Some(file);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn jitter_ms(range: u64) -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()))
        .unwrap_or_default();
    (nanos ^ u64::from(std::process::id())) % range.max(1)
}

/// Check whether a process with the given pid exists.
#[cfg(unix)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw == 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Check whether a process with the given pid exists.
///
/// Without a portable probe the holder is assumed alive.
#[cfg(not(unix))]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    pid != 0
}

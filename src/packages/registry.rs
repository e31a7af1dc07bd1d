//! Installed and enabled packages of a session.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::actions::{PackageActions, PKG_INF};
use crate::areas::ResourceArea;
use crate::fs_ops::{clear_dir, remove_dir_atomic, same_contents, write_atomic};
pub use crate::fs_ops::sha256_file;
use crate::log_channel::LogChannel;
use crate::{AppError, Result};

/// File below `PKG-INF/` holding the checksum of the unpacked archive.
pub const CHECKSUM_FILE: &str = "checksum";

/// Archive extension.
pub const ARCHIVE_EXT: &str = "par";

/// What the registry knows about one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    /// Package name.
    pub name: String,
    /// Unpacked directory.
    pub dir: PathBuf,
    /// Checksum of the archive it was unpacked from.
    pub checksum: Option<String>,
    /// Whether the package is enabled for queries.
    pub enabled: bool,
    /// Found in a read-only global directory.
    pub global: bool,
    #[serde(skip)]
    setup_done: bool,
}

/// Result of [`PackageRegistry::install`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The package is installed; `unpacked` is false when the recorded
    /// checksum already matched and nothing was done.
    Ok {
        /// Whether the archive was unpacked by this call.
        unpacked: bool,
    },
    /// The archive does not hash to the supplied checksum.
    ChecksumMismatch {
        /// Checksum supplied by the caller.
        expected: String,
        /// Checksum of the archive on disk.
        actual: String,
    },
    /// The archive is missing, or unpacking or building failed.
    UnpackFailure(String),
}

/// Result of [`PackageRegistry::enable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnableOutcome {
    /// Enabled (or already was).
    Ok,
    /// Neither the package area nor a global directory has the package.
    NotFound,
    /// The setup step failed; files are kept, the package stays disabled.
    SetupFailure(String),
}

/// Tracks packages in the shared package area and the global directories.
pub struct PackageRegistry {
    area: ResourceArea,
    global_dirs: Vec<PathBuf>,
    records: BTreeMap<String, PackageRecord>,
    actions: Arc<dyn PackageActions>,
    log: LogChannel,
}

impl std::fmt::Debug for PackageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageRegistry")
            .field("dir", &self.area.dir())
            .field("global_dirs", &self.global_dirs)
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

impl PackageRegistry {
    /// Create a registry over `area`.
    #[must_use]
    pub fn new(
        area: ResourceArea,
        global_dirs: Vec<PathBuf>,
        actions: Arc<dyn PackageActions>,
        log: LogChannel,
    ) -> Self {
        Self {
            area,
            global_dirs,
            records: BTreeMap::new(),
            actions,
            log,
        }
    }

    /// The package area directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.area.dir()
    }

    /// Location of the archive for `name` in the package area.
    #[must_use]
    pub fn archive_path(&self, name: &str) -> PathBuf {
        self.area.dir().join(format!("{name}.{ARCHIVE_EXT}"))
    }

    /// Install `name` from its archive, verifying `checksum` (SHA-256, hex).
    ///
    /// When `source` is given the archive is first copied into the package
    /// area, unless an identical archive is already there. Installing a name whose recorded checksum already equals
    /// `checksum` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Package` for an invalid name, `AppError::Lock` if
    /// the package area cannot be locked, or `AppError::Io` for filesystem
    /// failures outside the unpack step.
    pub async fn install(
        &mut self,
        name: &str,
        checksum: &str,
        source: Option<&Path>,
    ) -> Result<InstallOutcome> {
        validate_name(name)?;
        let root = self.area.dir().to_path_buf();
        let archive = root.join(format!("{name}.{ARCHIVE_EXT}"));
        let dir = root.join(name);
        let _area = self.area.lock().await?;

        if let Some(source) = source {
            if source != archive && !same_contents(source, &archive).unwrap_or(false) {
                if let Err(err) = fs::copy(source, &archive) {
                    return Ok(InstallOutcome::UnpackFailure(format!(
                        "cannot copy {}: {err}",
                        source.display()
                    )));
                }
            }
        }
        if !archive.is_file() {
            return Ok(InstallOutcome::UnpackFailure(format!(
                "archive {} not found",
                archive.display()
            )));
        }

        let actual = sha256_file(&archive)?;
        if !actual.eq_ignore_ascii_case(checksum) {
            warn!(package = name, expected = checksum, %actual, "package checksum mismatch");
            return Ok(InstallOutcome::ChecksumMismatch {
                expected: checksum.to_owned(),
                actual,
            });
        }

        if dir.is_dir() && read_checksum(&dir).as_deref() == Some(actual.as_str()) {
            self.records
                .entry(name.to_owned())
                .or_insert_with(|| PackageRecord {
                    name: name.to_owned(),
                    dir: dir.clone(),
                    checksum: Some(actual.clone()),
                    enabled: false,
                    global: false,
                    setup_done: false,
                });
            return Ok(InstallOutcome::Ok { unpacked: false });
        }

        remove_dir_atomic(&dir)?;
        self.log.append_line(&format!("Unpacking package {name}"))?;
        if let Err(err) = self.actions.unpack(&archive, &root, &self.log).await {
            return Ok(InstallOutcome::UnpackFailure(err.to_string()));
        }
        if !dir.is_dir() {
            return Ok(InstallOutcome::UnpackFailure(format!(
                "archive did not contain a top-level '{name}' directory"
            )));
        }
        if let Err(err) = self.actions.build(&dir, &self.log).await {
            self.log.append_line(&format!("Building package {name} failed"))?;
            return Ok(InstallOutcome::UnpackFailure(err.to_string()));
        }
        write_atomic(&dir.join(PKG_INF).join(CHECKSUM_FILE), actual.as_bytes())?;

        if self.records.get(name).is_some_and(|r| r.enabled) {
            self.log
                .append_line(&format!("Package {name} was reinstalled; enable it again"))?;
        }
        self.records.insert(
            name.to_owned(),
            PackageRecord {
                name: name.to_owned(),
                dir,
                checksum: Some(actual),
                enabled: false,
                global: false,
                setup_done: false,
            },
        );
        info!(package = name, "package installed");
        Ok(InstallOutcome::Ok { unpacked: true })
    }

    /// Enable `name`, running its setup step once.
    ///
    /// The package area is searched first, then the global directories in
    /// order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Package` for an invalid name or `AppError::Lock`
    /// if the package area cannot be locked.
    pub async fn enable(&mut self, name: &str) -> Result<EnableOutcome> {
        validate_name(name)?;
        if self.records.get(name).is_some_and(|r| r.enabled) {
            return Ok(EnableOutcome::Ok);
        }
        let Some((dir, global)) = self.locate(name) else {
            return Ok(EnableOutcome::NotFound);
        };
        let _area = self.area.lock().await?;

        let record = self
            .records
            .entry(name.to_owned())
            .or_insert_with(|| PackageRecord {
                name: name.to_owned(),
                dir: dir.clone(),
                checksum: read_checksum(&dir),
                enabled: false,
                global,
                setup_done: false,
            });
        record.dir.clone_from(&dir);
        record.global = global;

        if !record.setup_done {
            self.log.append_line(&format!("Enabling package {name}"))?;
            if let Err(err) = self.actions.setup(&dir, &self.log).await {
                warn!(package = name, %err, "package setup failed");
                return Ok(EnableOutcome::SetupFailure(err.to_string()));
            }
            record.setup_done = true;
        }
        record.enabled = true;
        info!(package = name, global, "package enabled");
        Ok(EnableOutcome::Ok)
    }

    /// Remove `name` from the enabled set.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the package is not enabled.
    pub fn unload(&mut self, name: &str) -> Result<()> {
        match self.records.get_mut(name) {
            Some(record) if record.enabled => {
                record.enabled = false;
                info!(package = name, "package unloaded");
                Ok(())
            }
            _ => Err(AppError::NotFound(format!("package {name} is not enabled"))),
        }
    }

    /// Unload every enabled package; returns how many were unloaded.
    pub fn unload_all(&mut self) -> usize {
        let mut count = 0;
        for record in self.records.values_mut().filter(|r| r.enabled) {
            record.enabled = false;
            count += 1;
        }
        count
    }

    /// Unload `name`, forget it and delete its unpacked directory. The
    /// archive stays, so installing again re-unpacks. Global packages are
    /// only unloaded.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the package is unknown, or
    /// `AppError::Lock` if the package area cannot be locked.
    pub async fn disable(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        let local_dir = self.area.dir().join(name);
        let known = self.records.contains_key(name) || local_dir.is_dir();
        if !known {
            return Err(AppError::NotFound(format!("package {name}")));
        }
        if self.records.get(name).is_some_and(|r| r.global) {
            if let Some(record) = self.records.get_mut(name) {
                record.enabled = false;
            }
            return Ok(());
        }
        let _area = self.area.lock().await?;
        self.records.remove(name);
        remove_dir_atomic(&local_dir)?;
        info!(package = name, "package disabled");
        Ok(())
    }

    /// Disable `name` and delete its archive too.
    ///
    /// # Errors
    ///
    /// See [`PackageRegistry::disable`].
    pub async fn clear(&mut self, name: &str) -> Result<()> {
        let archive = self.archive_path(name);
        let disabled = match self.disable(name).await {
            Ok(()) => true,
            Err(AppError::NotFound(_)) => false,
            Err(err) => return Err(err),
        };
        let _area = self.area.lock().await?;
        match fs::remove_file(&archive) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound && disabled => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("package {name}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Disable every local package and empty the package area; returns the
    /// number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lock` if the package area cannot be locked, or
    /// `AppError::Io` if it cannot be emptied.
    pub async fn clear_all(&mut self) -> Result<usize> {
        self.unload_all();
        let root = self.area.dir().to_path_buf();
        let _area = self.area.lock().await?;
        self.records.retain(|_, r| r.global);
        let removed = clear_dir(&root)?;
        info!(removed, "package area cleared");
        Ok(removed)
    }

    /// Disable every local package, keeping the archives; global packages
    /// are unloaded. Returns the number of packages disabled.
    ///
    /// # Errors
    ///
    /// See [`PackageRegistry::disable`].
    pub async fn disable_all(&mut self) -> Result<usize> {
        let mut names: Vec<String> = self.records.keys().cloned().collect();
        names.extend(
            self.list_installed()?
                .into_iter()
                .filter(|r| !r.global)
                .map(|r| r.name),
        );
        names.sort();
        names.dedup();
        let mut disabled = 0;
        for name in names {
            match self.disable(&name).await {
                Ok(()) => disabled += 1,
                Err(AppError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(disabled)
    }

    /// Enabled packages, sorted by name.
    #[must_use]
    pub fn list_enabled(&self) -> Vec<PackageRecord> {
        self.records.values().filter(|r| r.enabled).cloned().collect()
    }

    /// Names of the enabled packages.
    #[must_use]
    pub fn enabled_names(&self) -> Vec<String> {
        self.records
            .values()
            .filter(|r| r.enabled)
            .map(|r| r.name.clone())
            .collect()
    }

    /// Directories of the enabled packages.
    #[must_use]
    pub fn enabled_dirs(&self) -> Vec<PathBuf> {
        self.records
            .values()
            .filter(|r| r.enabled)
            .map(|r| r.dir.clone())
            .collect()
    }

    /// Every package available to this session: archives in the package
    /// area plus packages in the global directories.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Package` if a search pattern is invalid.
    pub fn list_installed(&self) -> Result<Vec<PackageRecord>> {
        let mut out: BTreeMap<String, PackageRecord> = BTreeMap::new();
        let pattern = self.area.dir().join(format!("*.{ARCHIVE_EXT}"));
        for path in glob_paths(&pattern)? {
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            let dir = self.area.dir().join(&name);
            out.insert(name.clone(), self.describe(&name, dir, false));
        }
        for global in &self.global_dirs {
            for path in glob_paths(&global.join("*"))? {
                if !path.is_dir() {
                    continue;
                }
                let Some(name) = path.file_name().map(|s| s.to_string_lossy().into_owned()) else {
                    continue;
                };
                out.entry(name.clone())
                    .or_insert_with(|| self.describe(&name, path.clone(), true));
            }
        }
        Ok(out.into_values().collect())
    }

    fn describe(&self, name: &str, dir: PathBuf, global: bool) -> PackageRecord {
        if let Some(record) = self.records.get(name) {
            return record.clone();
        }
        PackageRecord {
            name: name.to_owned(),
            checksum: read_checksum(&dir),
            dir,
            enabled: false,
            global,
            setup_done: false,
        }
    }

    fn locate(&self, name: &str) -> Option<(PathBuf, bool)> {
        let local = self.area.dir().join(name);
        if local.is_dir() {
            return Some((local, false));
        }
        self.global_dirs
            .iter()
            .map(|g| g.join(name))
            .find(|dir| dir.is_dir())
            .map(|dir| (dir, true))
    }
}

fn glob_paths(pattern: &Path) -> Result<Vec<PathBuf>> {
    let pattern = pattern.to_string_lossy();
    let paths = glob::glob(&pattern)
        .map_err(|err| AppError::Package(format!("bad search pattern '{pattern}': {err}")))?;
    Ok(paths.filter_map(std::result::Result::ok).collect())
}

fn read_checksum(dir: &Path) -> Option<String> {
    fs::read_to_string(dir.join(PKG_INF).join(CHECKSUM_FILE))
        .ok()
        .map(|raw| raw.trim().to_owned())
}

fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.starts_with('.');
    if bad {
        Err(AppError::Package(format!("invalid package name '{name}'")))
    } else {
        Ok(())
    }
}

//! Node configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::session::model::Role;
use crate::{AppError, Result};

/// Highest protocol revision this node speaks.
pub const PROTOCOL_VERSION: u32 = 11;

/// First protocol revision that streams query output object by object.
pub const STREAMED_OUTPUT_PROTOCOL: u32 = 11;

/// External command used to execute queries.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ExecutorConfig {
    /// Program to launch for each query.
    pub command: String,
    /// Arguments passed before any per-query data.
    #[serde(default)]
    pub args: Vec<String>,
}

/// A directly owned subordinate session.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SubordinateConfig {
    /// Ordinal of the subordinate, e.g. `0.1`.
    pub ordinal: String,
    /// Local socket name the subordinate listens on.
    pub ipc_name: String,
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("session-node")
}

fn default_lock_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_ordinal() -> String {
    "0".into()
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

fn default_max_queries() -> i64 {
    -1
}

fn default_lock_timeout() -> u64 {
    60
}

fn default_fanout_timeout() -> u64 {
    30
}

fn default_ipc_name() -> String {
    "session-node".into()
}

/// Global configuration parsed from `node.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root of the shared node directories (`cache/`, `packages/`, `queries/`).
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Directory holding advisory lock files.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    /// Role this session plays in the fan-out tree.
    #[serde(default)]
    pub role: Role,
    /// Ordinal path of this session in the fan-out tree.
    #[serde(default = "default_ordinal")]
    pub ordinal: String,
    /// Protocol revision offered during negotiation.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    /// Maximum number of kept query records; `-1` disables the quota.
    #[serde(default = "default_max_queries")]
    pub max_queries: i64,
    /// Upper bound for acquiring a resource area lock.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_seconds: u64,
    /// Upper bound for collecting subordinate acknowledgements.
    #[serde(default = "default_fanout_timeout")]
    pub fanout_timeout_seconds: u64,
    /// Named pipe / Unix socket identifier for the control connection.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Read-only directories searched for packages after the local area.
    #[serde(default)]
    pub global_package_dirs: Vec<PathBuf>,
    /// Default destination for archived query records.
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    /// Query executor.
    pub executor: Option<ExecutorConfig>,
    /// Directly owned subordinate sessions.
    #[serde(default)]
    pub subordinates: Vec<SubordinateConfig>,
    /// Named datasets known to the catalog.
    #[serde(default)]
    pub datasets: HashMap<String, Vec<PathBuf>>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            lock_dir: default_lock_dir(),
            role: Role::default(),
            ordinal: default_ordinal(),
            protocol_version: default_protocol_version(),
            max_queries: default_max_queries(),
            lock_timeout_seconds: default_lock_timeout(),
            fanout_timeout_seconds: default_fanout_timeout(),
            ipc_name: default_ipc_name(),
            global_package_dirs: Vec::new(),
            archive_dir: None,
            executor: None,
            subordinates: Vec::new(),
            datasets: HashMap::new(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Shared directory for cached files.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.work_dir.join("cache")
    }

    /// Shared directory for package archives and unpacked packages.
    #[must_use]
    pub fn package_dir(&self) -> PathBuf {
        self.work_dir.join("packages")
    }

    /// Shared directory for persisted query records.
    #[must_use]
    pub fn query_dir(&self) -> PathBuf {
        self.work_dir.join("queries")
    }

    /// Resource area lock timeout.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    /// Fan-out collection timeout.
    #[must_use]
    pub fn fanout_timeout(&self) -> Duration {
        Duration::from_secs(self.fanout_timeout_seconds)
    }

    /// Local socket name of the out-of-band interrupt channel.
    #[must_use]
    pub fn urgent_ipc_name(&self) -> String {
        format!("{}-urgent", self.ipc_name)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.max_queries < -1 {
            return Err(AppError::Config(
                "max_queries must be -1 (unlimited) or non-negative".into(),
            ));
        }

        if self.fanout_timeout_seconds == 0 {
            return Err(AppError::Config(
                "fanout_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.protocol_version == 0 || self.protocol_version > PROTOCOL_VERSION {
            return Err(AppError::Config(format!(
                "protocol_version must be between 1 and {PROTOCOL_VERSION}"
            )));
        }

        if !is_valid_ordinal(&self.ordinal) {
            return Err(AppError::Config(format!(
                "ordinal '{}' must be dot-separated numbers",
                self.ordinal
            )));
        }

        for sub in &self.subordinates {
            let direct_child = sub
                .ordinal
                .strip_prefix(&self.ordinal)
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|leaf| !leaf.is_empty() && leaf.chars().all(|c| c.is_ascii_digit()));
            if !direct_child {
                return Err(AppError::Config(format!(
                    "subordinate '{}' is not a direct child of '{}'",
                    sub.ordinal, self.ordinal
                )));
            }
        }

        let mut seen: Vec<&str> = Vec::with_capacity(self.subordinates.len());
        for sub in &self.subordinates {
            if seen.contains(&sub.ordinal.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate subordinate ordinal '{}'",
                    sub.ordinal
                )));
            }
            seen.push(&sub.ordinal);
        }

        Ok(())
    }
}

/// Whether `ordinal` looks like `0`, `0.1` or `0.1.3`.
#[must_use]
pub fn is_valid_ordinal(ordinal: &str) -> bool {
    !ordinal.is_empty()
        && ordinal
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

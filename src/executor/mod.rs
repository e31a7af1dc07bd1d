//! Seam to the external compute engine.
//!
//! The coordinator hands each running query to an [`Executor`] and awaits a
//! single terminal [`ExecOutcome`]. Stop and abort requests reach the
//! executor through [`ExecutionControl`].

pub mod catalog;
pub mod command;

use std::path::PathBuf;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::log_channel::LogChannel;
use crate::query::descriptor::{InputParam, QueryStatus};

pub use catalog::{DatasetCatalog, StaticCatalog};
pub use command::CommandExecutor;

/// Named collection of input files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    /// Catalog name.
    pub name: String,
    /// Member files.
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

/// Everything the executor needs to run one query.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Sequence number of the query.
    pub seq: u64,
    /// Free-form options.
    pub options: String,
    /// Named inputs.
    pub inputs: Vec<InputParam>,
    /// Dataset to process, if any.
    pub dataset: Option<Dataset>,
    /// First entry.
    pub first: u64,
    /// Entry count; negative means all.
    pub entries: i64,
    /// Directories of the enabled packages.
    pub packages: Vec<PathBuf>,
    /// Session log for progress text.
    pub log: LogChannel,
}

/// Stop and abort switches shared between the coordinator and a running
/// executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutionControl {
    stop: CancellationToken,
    abort: CancellationToken,
}

impl ExecutionControl {
    /// Fresh, untriggered switches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for an early stop that keeps partial results.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Ask for an abort that discards the query.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Whether an abort was requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Resolves once a stop is requested.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.stop.cancelled()
    }

    /// Resolves once an abort is requested.
    pub fn aborted(&self) -> WaitForCancellationFuture<'_> {
        self.abort.cancelled()
    }
}

/// Terminal state reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    /// All requested entries were processed.
    Completed,
    /// Stopped early; partial results are valid.
    Stopped,
    /// Aborted; results are discarded.
    Aborted,
}

impl From<ExecStatus> for QueryStatus {
    fn from(status: ExecStatus) -> Self {
        match status {
            ExecStatus::Completed => Self::Completed,
            ExecStatus::Stopped => Self::Stopped,
            ExecStatus::Aborted => Self::Aborted,
        }
    }
}

/// What an executor reports when a query ends.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    /// Terminal state.
    pub status: ExecStatus,
    /// Entries processed.
    pub events: u64,
    /// Bytes read from the dataset.
    pub bytes_read: u64,
    /// Output objects.
    pub output: Vec<Value>,
    /// Failure reason for aborted runs.
    pub error: Option<String>,
}

impl ExecOutcome {
    /// Successful run.
    #[must_use]
    pub fn completed(events: u64, output: Vec<Value>) -> Self {
        Self {
            status: ExecStatus::Completed,
            events,
            bytes_read: 0,
            output,
            error: None,
        }
    }

    /// Early stop with partial counts.
    #[must_use]
    pub fn stopped(events: u64, output: Vec<Value>) -> Self {
        Self {
            status: ExecStatus::Stopped,
            ..Self::completed(events, output)
        }
    }

    /// Aborted run.
    #[must_use]
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::Aborted,
            events: 0,
            bytes_read: 0,
            output: Vec::new(),
            error: Some(reason.into()),
        }
    }
}

/// External compute engine.
///
/// The returned future must not borrow the executor so the coordinator can
/// drive it as an independent task.
pub trait Executor: Send + Sync {
    /// Run one query to a terminal outcome.
    fn process(&self, request: ExecRequest, control: ExecutionControl) -> BoxFuture<'static, ExecOutcome>;
}

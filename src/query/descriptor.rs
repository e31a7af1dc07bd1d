//! Query descriptor model and lifecycle transitions.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::executor::Dataset;
use crate::session::model::SessionTag;
use crate::session::usage::ResourceUsage;
use crate::{AppError, Result};

/// Lifecycle status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Submitted, not started yet.
    Waiting,
    /// Currently executing.
    Running,
    /// Stopped early on request; partial results are kept.
    Stopped,
    /// Ran to completion.
    Completed,
    /// Aborted; never archived.
    Aborted,
}

impl QueryStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Aborted)
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Running)
                | (Self::Running, Self::Stopped | Self::Completed | Self::Aborted)
        )
    }
}

/// One named input parameter passed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputParam {
    /// Parameter name.
    pub name: String,
    /// Parameter value.
    pub value: Value,
}

/// Metadata and state for one submitted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// Session-scoped sequence number, starting at 1.
    pub seq: u64,
    /// Tag of the session that owns the query.
    pub session_tag: SessionTag,
    /// Free-form executor options.
    pub options: String,
    /// Named input parameters.
    #[serde(default)]
    pub inputs: Vec<InputParam>,
    /// First entry to process.
    pub first: u64,
    /// Number of entries to process; negative means all.
    pub entries: i64,
    /// Dataset the query runs over, if any.
    pub dataset: Option<Dataset>,
    /// Lifecycle status.
    pub status: QueryStatus,
    /// Disposable query; never persisted.
    #[serde(default)]
    pub draw: bool,
    /// Log offset captured when the query started.
    pub log_start: u64,
    /// Entries processed by the executor.
    pub events_processed: u64,
    /// Usage snapshot taken when the query started.
    pub usage_start: ResourceUsage,
    /// Usage snapshot taken when the query finished.
    pub usage_end: ResourceUsage,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// Start of execution.
    pub started_at: Option<DateTime<Utc>>,
    /// End of execution.
    pub finished_at: Option<DateTime<Utc>>,
    /// Packages enabled when the query started.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Log lines produced while the query ran.
    #[serde(default)]
    pub log_lines: Vec<String>,
    /// Output objects produced by the executor.
    #[serde(default)]
    pub output: Vec<Value>,
    /// Where the record was archived, if it was.
    pub archive_path: Option<PathBuf>,
    /// Executor error text for aborted queries.
    pub error: Option<String>,
}

/// Compact view of a query for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySummary {
    /// Fully qualified reference, `<tag>:<seq>`.
    pub reference: String,
    /// Sequence number.
    pub seq: u64,
    /// Owning session.
    pub session_tag: SessionTag,
    /// Lifecycle status.
    pub status: QueryStatus,
    /// Executor options.
    pub options: String,
    /// Dataset name, if any.
    pub dataset: Option<String>,
    /// Entries processed.
    pub events_processed: u64,
    /// End of execution.
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether the record was archived externally.
    pub archived: bool,
    /// Whether a record is still present on disk.
    pub stored: bool,
}

impl QueryDescriptor {
    /// Create a waiting descriptor.
    #[must_use]
    pub fn new(seq: u64, session_tag: SessionTag, options: impl Into<String>) -> Self {
        Self {
            seq,
            session_tag,
            options: options.into(),
            inputs: Vec::new(),
            first: 0,
            entries: -1,
            dataset: None,
            status: QueryStatus::Waiting,
            draw: false,
            log_start: 0,
            events_processed: 0,
            usage_start: ResourceUsage::default(),
            usage_end: ResourceUsage::default(),
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            packages: Vec::new(),
            log_lines: Vec::new(),
            output: Vec::new(),
            archive_path: None,
            error: None,
        }
    }

    /// `<tag>:<seq>`.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}:{}", self.session_tag, self.seq)
    }

    /// Move to `next`, validating the transition.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Query` for an illegal transition.
    pub fn set_status(&mut self, next: QueryStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::Query(format!(
                "query {} cannot move from {:?} to {next:?}",
                self.seq, self.status
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Mark the query running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Query` if the query is not waiting.
    pub fn start(&mut self, log_start: u64, packages: Vec<String>, usage: ResourceUsage) -> Result<()> {
        self.set_status(QueryStatus::Running)?;
        self.log_start = log_start;
        self.packages = packages;
        self.usage_start = usage;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Wall time between start and finish.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    /// CPU and bytes consumed while running.
    #[must_use]
    pub fn usage(&self) -> ResourceUsage {
        self.usage_end.since(&self.usage_start)
    }

    /// Listing view.
    #[must_use]
    pub fn summary(&self, stored: bool) -> QuerySummary {
        QuerySummary {
            reference: self.reference(),
            seq: self.seq,
            session_tag: self.session_tag.clone(),
            status: self.status,
            options: self.options.clone(),
            dataset: self.dataset.as_ref().map(|d| d.name.clone()),
            events_processed: self.events_processed,
            finished_at: self.finished_at,
            archived: self.archive_path.is_some(),
            stored,
        }
    }
}

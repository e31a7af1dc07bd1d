//! Control messages exchanged over the session connection.
//!
//! ## Requests
//!
//! One JSON object per line carrying a numeric operation code, an optional
//! correlation id and an operation-specific payload:
//! ```json
//! {"code": 8, "id": 1, "payload": {"options": "fast", "dataset": {"name": "runs"}}}
//! {"code": 16, "id": 2, "payload": {"action": "enable_package", "name": "tools"}}
//! ```
//!
//! ## Replies
//!
//! Tagged by `kind`. Every request is answered by zero or more informational
//! replies followed by exactly one `done`:
//! ```json
//! {"kind": "log", "text": "Enabling package tools\n"}
//! {"kind": "done", "id": 2, "op": 16, "ok": true}
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::executor::Dataset;
use crate::packages::PackageRecord;
use crate::query::descriptor::{InputParam, QueryDescriptor, QueryStatus, QuerySummary};
use crate::session::model::{Role, SessionState};
use crate::urgent::Interrupt;
use crate::{AppError, Result};

/// Operation codes understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum OpCode {
    /// Liveness probe.
    Ping = 1,
    /// Session state summary.
    Status = 2,
    /// Accumulated statistics.
    GetStats = 3,
    /// Number of active workers.
    GetParallel = 4,
    /// Protocol negotiation.
    Protocol = 5,
    /// Terminate the session.
    Stop = 6,
    /// Stop or abort the running query.
    StopProcess = 7,
    /// Submit a query.
    Process = 8,
    /// List queries.
    QueryList = 9,
    /// Remove a query record or purge the waiting queue.
    Remove = 10,
    /// Fetch a full query record.
    Retrieve = 11,
    /// Copy a query record to an archive location.
    Archive = 12,
    /// Report the retention quota.
    MaxQueries = 13,
    /// Remove a dead session's results.
    CleanupSession = 14,
    /// Replay a range of the session log.
    LogFile = 15,
    /// Cache and package management.
    Cache = 16,
    /// Activate or deactivate subordinates.
    WorkerLists = 17,
    /// Toggle live log streaming during execution.
    RealTimeLog = 18,
    /// Change the log filter of the session and its subordinates.
    LogLevel = 19,
}

impl OpCode {
    /// Every known operation.
    pub const ALL: [Self; 19] = [
        Self::Ping,
        Self::Status,
        Self::GetStats,
        Self::GetParallel,
        Self::Protocol,
        Self::Stop,
        Self::StopProcess,
        Self::Process,
        Self::QueryList,
        Self::Remove,
        Self::Retrieve,
        Self::Archive,
        Self::MaxQueries,
        Self::CleanupSession,
        Self::LogFile,
        Self::Cache,
        Self::WorkerLists,
        Self::RealTimeLog,
        Self::LogLevel,
    ];

    /// Resolve a wire code.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }

    /// Wire code.
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Inbound control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Operation code.
    pub code: u16,
    /// Correlation id echoed in the terminal `done` reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Operation-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl Request {
    /// Request without payload.
    #[must_use]
    pub fn new(op: OpCode) -> Self {
        Self {
            code: op.code(),
            id: None,
            payload: Value::Null,
        }
    }

    /// Request with a typed payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the payload cannot be encoded.
    pub fn with_payload(op: OpCode, payload: &impl Serialize) -> Result<Self> {
        Ok(Self {
            code: op.code(),
            id: None,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// The operation, if the code is known.
    #[must_use]
    pub fn op(&self) -> Option<OpCode> {
        OpCode::from_code(self.code)
    }

    /// Decode the payload; a missing payload decodes as `{}`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the payload does not match `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let value = if self.payload.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            self.payload.clone()
        };
        serde_json::from_value(value).map_err(|err| {
            AppError::Protocol(format!("bad payload for op {}: {err}", self.code))
        })
    }
}

fn all_entries() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

/// How a submission names its dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    /// Catalog name, or a label for an inline file list.
    pub name: String,
    /// Inline file list; resolved through the catalog when empty.
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl From<Dataset> for DatasetRef {
    fn from(dataset: Dataset) -> Self {
        Self {
            name: dataset.name,
            files: dataset.files,
        }
    }
}

/// Payload of [`OpCode::Process`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRequest {
    /// Executor options.
    #[serde(default)]
    pub options: String,
    /// Named inputs.
    #[serde(default)]
    pub inputs: Vec<InputParam>,
    /// Dataset to process.
    #[serde(default)]
    pub dataset: Option<DatasetRef>,
    /// First entry.
    #[serde(default)]
    pub first: u64,
    /// Entry count; negative means all.
    #[serde(default = "all_entries")]
    pub entries: i64,
    /// Whether the submitter waits for the result.
    #[serde(default = "default_true")]
    pub sync: bool,
    /// Disposable query, never persisted.
    #[serde(default)]
    pub draw: bool,
}

impl Default for ProcessRequest {
    fn default() -> Self {
        Self {
            options: String::new(),
            inputs: Vec::new(),
            dataset: None,
            first: 0,
            entries: all_entries(),
            sync: true,
            draw: false,
        }
    }
}

/// Payload of [`OpCode::StopProcess`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopProcessRequest {
    /// Abort (discard) instead of stopping (keep partial results).
    #[serde(default)]
    pub abort: bool,
    /// Give up on the executor after this many seconds and record the
    /// query as aborted.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Payload of [`OpCode::QueryList`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryListRequest {
    /// Include queries of previous sessions.
    #[serde(default)]
    pub all: bool,
}

/// Payload of [`OpCode::Remove`] and [`OpCode::Retrieve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRequest {
    /// Query reference, or a special keyword for `Remove`.
    pub reference: String,
}

/// Payload of [`OpCode::Archive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRequest {
    /// Query reference, or `Default` to set the default archive directory.
    pub reference: String,
    /// Destination file or directory.
    #[serde(default)]
    pub path: String,
}

/// Payload of [`OpCode::CleanupSession`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSessionRequest {
    /// Session tag, bare or as `session-<tag>`.
    pub tag: String,
}

/// Payload of [`OpCode::LogFile`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFileRequest {
    /// Start offset; when absent, pending live output is sent.
    #[serde(default)]
    pub start: Option<u64>,
    /// End offset; defaults to the end of the log.
    #[serde(default)]
    pub end: Option<u64>,
}

/// Payload of [`OpCode::Protocol`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolRequest {
    /// Revision offered by the peer.
    pub version: u32,
}

/// Payload of [`OpCode::RealTimeLog`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealTimeLogRequest {
    /// Stream the log while queries run.
    pub on: bool,
}

/// Payload of [`OpCode::LogLevel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLevelRequest {
    /// Filter directives, e.g. `debug` or `info,session_node::lock=trace`.
    pub filter: String,
}

/// Action of a [`OpCode::WorkerLists`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAction {
    /// Include subordinates in fan-out.
    Activate,
    /// Exclude subordinates from fan-out.
    Deactivate,
}

/// Payload of [`OpCode::WorkerLists`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerListsRequest {
    /// What to do.
    pub action: WorkerAction,
    /// Subordinate ordinal, or `*` for all.
    pub ordinal: String,
}

/// Payload of [`OpCode::Cache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CacheRequest {
    /// Write the cache content to the log.
    ShowCache,
    /// Empty the cache.
    ClearCache,
    /// Copy a file into the cache.
    AddToCache {
        /// Source file.
        path: PathBuf,
    },
    /// Write the available packages to the log.
    ShowPackages,
    /// Reply with the available packages.
    ListPackages,
    /// Write the enabled packages to the log.
    ShowEnabledPackages,
    /// Reply with the enabled packages.
    ListEnabledPackages,
    /// Install a package from its archive.
    InstallPackage {
        /// Package name.
        name: String,
        /// Expected SHA-256 of the archive, hex.
        checksum: String,
        /// Archive to copy into the package area first.
        #[serde(default)]
        archive: Option<PathBuf>,
    },
    /// Enable an installed package.
    EnablePackage {
        /// Package name.
        name: String,
    },
    /// Unload one package.
    UnloadPackage {
        /// Package name.
        name: String,
    },
    /// Unload every package.
    UnloadPackages,
    /// Disable one package, deleting its unpacked files.
    DisablePackage {
        /// Package name.
        name: String,
    },
    /// Disable every local package.
    DisablePackages,
    /// Delete one package including its archive.
    ClearPackage {
        /// Package name.
        name: String,
    },
    /// Empty the package area.
    ClearPackages,
}

impl CacheRequest {
    /// Whether subordinates repeat the action. Listing requests return data
    /// to the direct caller only.
    #[must_use]
    pub fn fans_out(&self) -> bool {
        !matches!(self, Self::ListPackages | Self::ListEnabledPackages)
    }
}

/// Per-subordinate entry of a status reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubordinateStatus {
    /// Ordinal.
    pub ordinal: String,
    /// Included in fan-out.
    pub active: bool,
}

/// Outbound reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    /// Sent once when the session is ready.
    SessionTag {
        /// Session tag.
        tag: String,
        /// Ordinal.
        ordinal: String,
        /// Protocol revision offered.
        protocol: u32,
    },
    /// Session log output.
    Log {
        /// Log text.
        text: String,
    },
    /// Asynchronous notice for the operator.
    Message {
        /// Notice text.
        text: String,
    },
    /// Terminal reply to one request.
    Done {
        /// Correlation id of the request.
        #[serde(default)]
        id: Option<u64>,
        /// Operation code of the request.
        op: u16,
        /// Whether the operation succeeded.
        ok: bool,
        /// Failure description.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A query was queued.
    QuerySubmitted {
        /// Assigned sequence number.
        seq: u64,
    },
    /// A query started running.
    StartProcess {
        /// Sequence number.
        seq: u64,
        /// Requested entries.
        entries: i64,
    },
    /// A query ended before completing.
    StopProcess {
        /// Sequence number.
        seq: u64,
        /// Entries processed.
        events: u64,
        /// Whether the query was aborted.
        aborted: bool,
    },
    /// Header preceding per-object output.
    QueryInfo {
        /// Sequence number.
        seq: u64,
        /// Final status.
        status: QueryStatus,
        /// Entries processed.
        events: u64,
        /// Number of output objects that follow.
        objects: usize,
    },
    /// One output object.
    OutputObject {
        /// Sequence number.
        seq: u64,
        /// Position in the output.
        index: usize,
        /// Whether this is the final object.
        last: bool,
        /// The object.
        object: Value,
    },
    /// All output objects at once.
    OutputList {
        /// Sequence number.
        seq: u64,
        /// Final status.
        status: QueryStatus,
        /// The objects.
        objects: Vec<Value>,
    },
    /// The waiting queue is drained.
    SetIdle,
    /// Query listing.
    QueryList {
        /// Summaries.
        queries: Vec<QuerySummary>,
    },
    /// A full query record.
    Retrieved {
        /// The record.
        query: Box<QueryDescriptor>,
    },
    /// A record was archived.
    Archived {
        /// Destination.
        path: PathBuf,
    },
    /// Accumulated statistics.
    Stats {
        /// Messages handled.
        handled: u64,
        /// Queries executed.
        queries_processed: u64,
        /// Wall seconds spent handling messages.
        real_time_secs: f64,
        /// CPU seconds spent handling messages.
        cpu_secs: f64,
        /// Bytes read by queries.
        bytes_read: u64,
    },
    /// Session state summary.
    Status {
        /// Session tag.
        tag: String,
        /// Role.
        role: Role,
        /// Ordinal.
        ordinal: String,
        /// State.
        state: SessionState,
        /// Negotiated protocol.
        protocol: u32,
        /// Queries waiting.
        waiting: usize,
        /// Running query, if any.
        running: Option<u64>,
        /// Enabled packages.
        enabled_packages: Vec<String>,
        /// Direct subordinates.
        subordinates: Vec<SubordinateStatus>,
    },
    /// Number of active workers.
    Parallel {
        /// Worker count.
        workers: usize,
    },
    /// Retention quota.
    MaxQueries {
        /// Quota; `-1` is unlimited.
        max_kept: i64,
    },
    /// Log filter now in effect.
    LogLevel {
        /// Filter directives.
        filter: String,
    },
    /// Negotiated protocol revision.
    Protocol {
        /// Agreed revision.
        version: u32,
    },
    /// Package listing.
    Packages {
        /// Records.
        packages: Vec<PackageRecord>,
    },
    /// An out-of-band interrupt was handled.
    InterruptAck {
        /// Which interrupt.
        interrupt: Interrupt,
    },
}

impl Reply {
    /// Successful terminal reply.
    #[must_use]
    pub fn done_ok(id: Option<u64>, op: u16) -> Self {
        Self::Done {
            id,
            op,
            ok: true,
            error: None,
        }
    }

    /// Failed terminal reply.
    #[must_use]
    pub fn done_err(id: Option<u64>, op: u16, error: impl Into<String>) -> Self {
        Self::Done {
            id,
            op,
            ok: false,
            error: Some(error.into()),
        }
    }

    /// Whether this is a terminal reply.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

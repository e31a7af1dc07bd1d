//! Executor backed by an external command.
//!
//! Each query launches the configured program with:
//! - `env_clear()` plus a small allowlist, and the query described through
//!   `NODE_QUERY_*` variables;
//! - the inputs and dataset files as one JSON document on stdin;
//! - `kill_on_drop(true)` so an abandoned run never outlives the session.
//!
//! The program reports on stdout. Lines that are JSON objects carrying
//! `output`, `events` or `bytes_read` update the outcome; every other stdout
//! or stderr line is appended to the session log.

use std::path::PathBuf;
use std::process::Stdio;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use super::{ExecOutcome, ExecRequest, ExecStatus, ExecutionControl, Executor};
use crate::config::ExecutorConfig;
use crate::{AppError, Result};

/// Environment variables inherited by the executor process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "LD_LIBRARY_PATH",
    "TMPDIR",
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
];

/// Runs queries through an external program.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: String,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl CommandExecutor {
    /// Build from the `[executor]` configuration table.
    #[must_use]
    pub fn new(config: &ExecutorConfig, work_dir: PathBuf) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            work_dir,
        }
    }
}

impl Executor for CommandExecutor {
    fn process(&self, request: ExecRequest, control: ExecutionControl) -> BoxFuture<'static, ExecOutcome> {
        let this = self.clone();
        Box::pin(async move {
            let seq = request.seq;
            match this.run(request, control).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(seq, %err, "executor failed");
                    ExecOutcome::aborted(err.to_string())
                }
            }
        })
    }
}

#[derive(Debug, Default)]
struct Progress {
    events: u64,
    bytes_read: u64,
    output: Vec<Value>,
}

impl Progress {
    /// Apply one stdout line; returns the line back when it is plain text.
    fn apply<'a>(&mut self, line: &'a str) -> Option<&'a str> {
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) else {
            return Some(line);
        };
        let mut recognised = false;
        if let Some(events) = map.get("events").and_then(Value::as_u64) {
            self.events = events;
            recognised = true;
        }
        if let Some(bytes) = map.get("bytes_read").and_then(Value::as_u64) {
            self.bytes_read = bytes;
            recognised = true;
        }
        if let Some(object) = map.get("output") {
            self.output.push(object.clone());
            recognised = true;
        }
        if recognised {
            None
        } else {
            Some(line)
        }
    }
}

impl CommandExecutor {
    async fn run(&self, request: ExecRequest, control: ExecutionControl) -> Result<ExecOutcome> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        let packages = request
            .packages
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");
        cmd.env("NODE_QUERY_SEQ", request.seq.to_string())
            .env("NODE_QUERY_OPTIONS", &request.options)
            .env("NODE_QUERY_FIRST", request.first.to_string())
            .env("NODE_QUERY_ENTRIES", request.entries.to_string())
            .env("NODE_PACKAGES", packages);
        if let Some(ref dataset) = request.dataset {
            cmd.env("NODE_QUERY_DATASET", &dataset.name);
        }

        cmd.current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Executor(format!("failed to spawn {}: {err}", self.command)))?;
        info!(seq = request.seq, command = %self.command, "executor started");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Executor("failed to capture executor stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Executor("failed to capture executor stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Executor("failed to capture executor stderr".into()))?;

        let document = json!({
            "inputs": request.inputs,
            "files": request.dataset.as_ref().map(|d| d.files.clone()).unwrap_or_default(),
        });
        let mut payload = serde_json::to_vec(&document)?;
        payload.push(b'\n');
        stdin
            .write_all(&payload)
            .await
            .map_err(|err| AppError::Executor(format!("cannot write executor input: {err}")))?;
        drop(stdin);

        let stderr_log = request.log.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = stderr_log.append_line(&line);
            }
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut progress = Progress::default();
        let mut stop_sent = false;
        let mut aborted = false;

        loop {
            tokio::select! {
                biased;

                () = control.aborted(), if !aborted => {
                    aborted = true;
                    child.kill().await.ok();
                }

                () = control.stopped(), if !stop_sent => {
                    stop_sent = true;
                    request_stop(&child);
                }

                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(text) = progress.apply(&line) {
                            request.log.append_line(text)?;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(seq = request.seq, %err, "executor stdout read failed");
                        break;
                    }
                },
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|err| AppError::Executor(format!("cannot wait for executor: {err}")))?;
        stderr_task.await.ok();

        if aborted || control.is_aborted() {
            return Ok(ExecOutcome::aborted("aborted on request"));
        }
        let outcome_status = if stop_sent {
            ExecStatus::Stopped
        } else if status.success() {
            ExecStatus::Completed
        } else {
            return Ok(ExecOutcome::aborted(format!("executor exited with {status}")));
        };

        Ok(ExecOutcome {
            status: outcome_status,
            events: progress.events,
            bytes_read: progress.bytes_read,
            output: progress.output,
            error: None,
        })
    }
}

#[cfg(unix)]
fn request_stop(child: &tokio::process::Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!(pid, %err, "cannot signal executor");
        }
    }
}

#[cfg(not(unix))]
fn request_stop(_child: &tokio::process::Child) {
    warn!("graceful executor stop is not supported on this platform");
}

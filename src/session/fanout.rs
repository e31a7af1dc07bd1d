//! Broadcast-then-collect to directly owned subordinate sessions.
//!
//! A coordinator performs an operation locally, then sends the same request
//! to every active subordinate and waits, up to a shared deadline, for each
//! one's terminal `done` reply. Informational replies received while waiting
//! are passed upstream unchanged.

use std::fmt::Write as _;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::protocol::messages::SubordinateStatus;
use crate::protocol::{Reply, Request};
use crate::urgent::Interrupt;
use crate::{AppError, Result};

/// Channels to one subordinate session.
#[derive(Debug)]
pub struct SubordinateLink {
    ordinal: String,
    active: bool,
    requests: mpsc::Sender<Request>,
    replies: mpsc::Receiver<Reply>,
    urgent: mpsc::Sender<Interrupt>,
}

impl SubordinateLink {
    /// Wrap the channels of a connected subordinate. Links start active.
    #[must_use]
    pub fn new(
        ordinal: impl Into<String>,
        requests: mpsc::Sender<Request>,
        replies: mpsc::Receiver<Reply>,
        urgent: mpsc::Sender<Interrupt>,
    ) -> Self {
        Self {
            ordinal: ordinal.into(),
            active: true,
            requests,
            replies,
            urgent,
        }
    }

    /// Ordinal of the subordinate.
    #[must_use]
    pub fn ordinal(&self) -> &str {
        &self.ordinal
    }

    /// Whether the subordinate takes part in fan-out.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Who answered a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Subordinates that replied with success.
    pub acknowledged: Vec<String>,
    /// Subordinates that failed, with their reason.
    pub failed: Vec<(String, String)>,
    /// Subordinates that did not answer before the deadline.
    pub timed_out: Vec<String>,
}

impl FanoutReport {
    /// Whether every addressed subordinate acknowledged.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }

    /// Turn a partial failure into an error naming the missing subordinates.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` unless the report is complete.
    pub fn into_result(self) -> Result<()> {
        if self.is_complete() {
            return Ok(());
        }
        let mut message = String::from("fan-out incomplete:");
        for (ordinal, reason) in &self.failed {
            let _ = write!(message, " {ordinal} failed ({reason});");
        }
        for ordinal in &self.timed_out {
            let _ = write!(message, " {ordinal} timed out;");
        }
        Err(AppError::Transport(message.trim_end_matches(';').to_owned()))
    }
}

/// The directly owned subordinates of a session.
#[derive(Debug)]
pub struct Subordinates {
    links: Vec<SubordinateLink>,
    timeout: Duration,
    next_id: u64,
}

impl Subordinates {
    /// Manage `links`, waiting at most `timeout` per broadcast.
    #[must_use]
    pub fn new(links: Vec<SubordinateLink>, timeout: Duration) -> Self {
        Self {
            links,
            timeout,
            next_id: 1,
        }
    }

    /// No subordinates at all.
    #[must_use]
    pub fn none() -> Self {
        Self::new(Vec::new(), Duration::from_secs(1))
    }

    /// Whether there are no subordinates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Number of active subordinates.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.links.iter().filter(|l| l.active).count()
    }

    /// Status of every subordinate.
    #[must_use]
    pub fn statuses(&self) -> Vec<SubordinateStatus> {
        self.links
            .iter()
            .map(|l| SubordinateStatus {
                ordinal: l.ordinal.clone(),
                active: l.active,
            })
            .collect()
    }

    /// Activate or deactivate the subordinate at `ordinal`, or all of them
    /// for `*`. Returns how many links changed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no subordinate has `ordinal`.
    pub fn set_active(&mut self, ordinal: &str, active: bool) -> Result<usize> {
        let mut matched = false;
        let mut changed = 0;
        for link in &mut self.links {
            if ordinal == "*" || link.ordinal == ordinal {
                matched = true;
                if link.active != active {
                    link.active = active;
                    changed += 1;
                }
            }
        }
        if !matched && ordinal != "*" {
            return Err(AppError::NotFound(format!("subordinate {ordinal}")));
        }
        info!(ordinal, active, changed, "worker list updated");
        Ok(changed)
    }

    /// Send `request` to every active subordinate and collect their `done`
    /// replies. Other replies are forwarded to `upstream`.
    pub async fn broadcast(&mut self, request: &Request, upstream: &mpsc::Sender<Reply>) -> FanoutReport {
        let id = self.next_id;
        self.next_id += 1;
        let mut report = FanoutReport::default();
        let mut pending = Vec::new();

        for (idx, link) in self.links.iter().enumerate().filter(|(_, l)| l.active) {
            let outgoing = request.clone().with_id(id);
            if link.requests.send(outgoing).await.is_ok() {
                pending.push(idx);
            } else {
                warn!(ordinal = %link.ordinal, "subordinate connection closed");
                report
                    .failed
                    .push((link.ordinal.clone(), "connection closed".into()));
            }
        }

        let deadline = Instant::now() + self.timeout;
        for idx in pending {
            let link = &mut self.links[idx];
            loop {
                match timeout_at(deadline, link.replies.recv()).await {
                    Ok(Some(Reply::Done { id: Some(got), ok, error, .. })) if got == id => {
                        if ok {
                            report.acknowledged.push(link.ordinal.clone());
                        } else {
                            report.failed.push((
                                link.ordinal.clone(),
                                error.unwrap_or_else(|| "operation failed".into()),
                            ));
                        }
                        break;
                    }
                    Ok(Some(Reply::Done { id: stale, .. })) => {
                        debug!(ordinal = %link.ordinal, ?stale, "ignoring stale acknowledgement");
                    }
                    Ok(Some(Reply::SessionTag { .. })) => {}
                    Ok(Some(other)) => {
                        if upstream.send(other).await.is_err() {
                            debug!("upstream closed while forwarding subordinate output");
                        }
                    }
                    Ok(None) => {
                        warn!(ordinal = %link.ordinal, "subordinate closed during fan-out");
                        report
                            .failed
                            .push((link.ordinal.clone(), "connection closed".into()));
                        break;
                    }
                    Err(_) => {
                        warn!(ordinal = %link.ordinal, "subordinate did not acknowledge in time");
                        report.timed_out.push(link.ordinal.clone());
                        break;
                    }
                }
            }
        }
        report
    }

    /// Forward an interrupt to every active subordinate.
    pub async fn interrupt(&self, interrupt: Interrupt) {
        for link in self.links.iter().filter(|l| l.active) {
            if link.urgent.send(interrupt).await.is_err() {
                warn!(ordinal = %link.ordinal, ?interrupt, "cannot forward interrupt");
            }
        }
    }
}

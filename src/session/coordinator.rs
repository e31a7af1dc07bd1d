//! The session state machine and message dispatcher.
//!
//! One coordinator task owns the session. It pulls control requests from the
//! inbound channel in arrival order and routes each through the
//! [`HandlerTable`]. While a query executes, the same task keeps polling the
//! inbound channel through a restricted pump that only accepts operations
//! flagged as safe during execution. Urgent interrupts arrive on their own
//! channel and are polled ahead of everything else.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use super::fanout::{FanoutReport, Subordinates};
use super::handlers::HandlerTable;
use super::model::{Session, SessionState};
use super::usage::{cpu_time, ResourceUsage};
use crate::areas::ResourceAreas;
use crate::cache::FileCache;
use crate::config::{GlobalConfig, STREAMED_OUTPUT_PROTOCOL};
use crate::executor::{Dataset, DatasetCatalog, ExecOutcome, ExecRequest, ExecStatus, ExecutionControl, Executor};
use crate::log_channel::LogChannel;
use crate::log_level::LogLevelControl;
use crate::packages::{PackageActions, PackageRegistry};
use crate::protocol::messages::ProcessRequest;
use crate::protocol::{Reply, Request};
use crate::query::descriptor::{QueryDescriptor, QueryStatus, QuerySummary};
use crate::query::store::{QueryStore, SaveOutcome, QUOTA_EXCEEDED_MESSAGE};
use crate::urgent::Interrupt;
use crate::{AppError, Result};

/// External collaborators of a session.
#[derive(Clone)]
pub struct NodeServices {
    /// Runs queries.
    pub executor: Arc<dyn Executor>,
    /// Resolves dataset names.
    pub catalog: Arc<dyn DatasetCatalog>,
    /// Unpacks, builds and sets up packages.
    pub package_actions: Arc<dyn PackageActions>,
    /// Changes the log filter at run time.
    pub log_level: LogLevelControl,
}

impl std::fmt::Debug for NodeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeServices").finish_non_exhaustive()
    }
}

/// The coordinator's ends of the control, reply and interrupt channels.
#[derive(Debug)]
pub struct SessionChannels {
    /// Control requests in arrival order.
    pub inbound: mpsc::Receiver<Request>,
    /// Replies to the requester.
    pub outbound: mpsc::Sender<Reply>,
    /// Out-of-band interrupts.
    pub urgent: mpsc::Receiver<Interrupt>,
}

/// Counters reported by `GetStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
    /// Messages handled.
    pub handled: u64,
    /// Queries executed to a terminal state.
    pub queries_processed: u64,
    /// Wall time spent in handlers.
    pub real_time: Duration,
    /// CPU time spent in handlers.
    pub cpu: Duration,
    /// Bytes read by all queries.
    pub bytes_read: u64,
}

#[derive(Debug)]
pub(super) struct RunningQuery {
    pub(super) control: ExecutionControl,
    pub(super) stop_deadline: Option<Instant>,
    pub(super) summary: QuerySummary,
}

/// Owns one session and everything it manages.
pub struct SessionCoordinator {
    pub(super) session: Session,
    pub(super) log: LogChannel,
    pub(super) packages: PackageRegistry,
    pub(super) cache: FileCache,
    pub(super) store: QueryStore,
    pub(super) executor: Arc<dyn Executor>,
    pub(super) catalog: Arc<dyn DatasetCatalog>,
    pub(super) log_level: LogLevelControl,
    pub(super) subordinates: Subordinates,
    pub(super) real_time_log: bool,
    pub(super) stats: SessionStats,
    pub(super) waiting: VecDeque<QueryDescriptor>,
    pub(super) running: Option<RunningQuery>,
    inbound: mpsc::Receiver<Request>,
    outbound: mpsc::Sender<Reply>,
    urgent: mpsc::Receiver<Interrupt>,
    handlers: HandlerTable,
    next_seq: u64,
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("session", &self.session)
            .field("waiting", &self.waiting.len())
            .field("next_seq", &self.next_seq)
            .finish_non_exhaustive()
    }
}

impl SessionCoordinator {
    /// Open the resource areas and the query store for `session`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if a directory cannot be created,
    /// `AppError::Lock` if the session's results are already locked, or
    /// `AppError::Config` if the handler table is incomplete.
    pub fn open(
        session: Session,
        config: &GlobalConfig,
        log: LogChannel,
        services: NodeServices,
        channels: SessionChannels,
        subordinates: Subordinates,
    ) -> Result<Self> {
        let areas = ResourceAreas::open(config)?;
        let store = QueryStore::open(
            areas.queries,
            &config.lock_dir,
            session.tag().clone(),
            config.max_queries,
            config.archive_dir.clone(),
        )?;
        let packages = PackageRegistry::new(
            areas.packages,
            config.global_package_dirs.clone(),
            services.package_actions,
            log.clone(),
        );
        Ok(Self {
            session,
            log,
            packages,
            cache: FileCache::new(areas.cache),
            store,
            executor: services.executor,
            catalog: services.catalog,
            log_level: services.log_level,
            subordinates,
            real_time_log: false,
            stats: SessionStats::default(),
            waiting: VecDeque::new(),
            running: None,
            inbound: channels.inbound,
            outbound: channels.outbound,
            urgent: channels.urgent,
            handlers: HandlerTable::standard()?,
            next_seq: 1,
        })
    }

    /// The session.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Accumulated statistics.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Serve requests until the session terminates.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures that make the session unusable.
    pub async fn run(mut self) -> Result<()> {
        let span = info_span!("session", tag = %self.session.tag(), ordinal = %self.session.ordinal());
        async move {
            self.setup().await?;
            while self.session.state() != SessionState::Terminating {
                tokio::select! {
                    biased;
                    Some(interrupt) = self.urgent.recv() => self.on_interrupt(interrupt).await?,
                    request = self.inbound.recv() => match request {
                        Some(request) => self.dispatch(request, false).await,
                        None => {
                            info!("control connection closed");
                            self.session.transition(SessionState::Terminating)?;
                        }
                    },
                }
            }
            self.shutdown().await
        }
        .instrument(span)
        .await
    }

    async fn setup(&mut self) -> Result<()> {
        info!(role = ?self.session.role(), "session starting");
        if self.session.is_coordinator() {
            self.enforce_quota().await;
        }
        self.session.transition(SessionState::Idle)?;
        self.send(Reply::SessionTag {
            tag: self.session.tag().to_string(),
            ordinal: self.session.ordinal().to_owned(),
            protocol: self.session.protocol(),
        })
        .await;
        self.flush_log().await;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.flush_log().await;
        self.store.close()?;
        info!(handled = self.stats.handled, "session terminated");
        Ok(())
    }

    /// Route one request through the handler table and answer it with the
    /// live log flush and a terminal `done` reply.
    ///
    /// With `restricted` set only operations allowed during execution run;
    /// everything else is answered with a failure.
    pub async fn dispatch(&mut self, request: Request, restricted: bool) {
        let started = std::time::Instant::now();
        let cpu_before = cpu_time();
        let id = request.id;
        let code = request.code;

        let result = match (request.op(), self.handlers.get(code)) {
            (Some(op), Some(entry)) if !restricted || entry.during_execution => {
                let span = info_span!("dispatch", %op, ?id);
                (entry.handler)(self, request).instrument(span).await
            }
            (Some(op), Some(_)) => {
                warn!(%op, "operation not allowed while a query is running");
                Err(AppError::Protocol(format!(
                    "{op} is not allowed while a query is running"
                )))
            }
            _ => {
                warn!(code, "unknown operation code");
                Err(AppError::Protocol(format!("unknown operation code {code}")))
            }
        };
        self.finish(id, code, result).await;

        self.stats.handled += 1;
        self.stats.real_time += started.elapsed();
        self.stats.cpu += cpu_time().saturating_sub(cpu_before);
    }

    async fn finish(&mut self, id: Option<u64>, code: u16, result: Result<()>) {
        let reply = match result {
            Ok(()) => Reply::done_ok(id, code),
            Err(err) => {
                debug!(code, %err, "operation failed");
                if let Err(log_err) = self.log.append_line(&format!("Error: {err}")) {
                    warn!(%log_err, "cannot write to session log");
                }
                Reply::done_err(id, code, err.to_string())
            }
        };
        self.flush_log().await;
        self.send(reply).await;
    }

    pub(super) async fn send(&self, reply: Reply) {
        if self.outbound.send(reply).await.is_err() {
            debug!("requester gone; reply dropped");
        }
    }

    /// Stream pending log output upstream.
    pub(super) async fn flush_log(&self) {
        match self.log.flush_live() {
            Ok(text) if !text.is_empty() => self.send(Reply::Log { text }).await,
            Ok(_) => {}
            Err(err) => warn!(%err, "cannot read session log"),
        }
    }

    /// Write a diagnostic line to the session log.
    pub(super) fn note(&self, line: &str) {
        if let Err(err) = self.log.append_line(line) {
            warn!(%err, "cannot write to session log");
        }
    }

    /// Broadcast `request` to the active subordinates.
    pub(super) async fn fan_out(&mut self, request: &Request) -> FanoutReport {
        if self.subordinates.is_empty() {
            return FanoutReport::default();
        }
        self.subordinates.broadcast(request, &self.outbound).await
    }

    async fn enforce_quota(&mut self) {
        match self.store.apply_quota().await {
            Ok(report) if !report.removed.is_empty() => {
                info!(removed = report.removed.len(), "old query records evicted");
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "cannot apply query quota"),
        }
    }

    // ── Interrupts ──────────────────────────────────────────

    async fn on_interrupt(&mut self, interrupt: Interrupt) -> Result<()> {
        info!(?interrupt, "urgent interrupt");
        self.subordinates.interrupt(interrupt).await;
        match interrupt {
            Interrupt::Hard => {
                if let Some(running) = &self.running {
                    running.control.abort();
                }
                let mut discarded = 0_usize;
                while self.inbound.try_recv().is_ok() {
                    discarded += 1;
                }
                if discarded > 0 {
                    warn!(discarded, "queued messages discarded");
                }
            }
            Interrupt::Soft => {
                if let Some(running) = &self.running {
                    running.control.stop();
                }
            }
            Interrupt::Shutdown => {
                if let Some(running) = &self.running {
                    running.control.abort();
                }
                self.session.transition(SessionState::Terminating)?;
            }
        }
        self.send(Reply::InterruptAck { interrupt }).await;
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────

    /// Create a waiting descriptor for `request` and return its sequence
    /// number.
    pub(super) fn submit(&mut self, request: ProcessRequest) -> Result<u64> {
        let dataset = match request.dataset {
            None => None,
            Some(named) if named.files.is_empty() => Some(
                self.catalog
                    .lookup(&named.name)
                    .ok_or_else(|| AppError::NotFound(format!("dataset {}", named.name)))?,
            ),
            Some(inline) => {
                let dataset = Dataset {
                    name: inline.name,
                    files: inline.files,
                };
                if !dataset.name.is_empty() {
                    self.catalog.register(dataset.clone())?;
                }
                Some(dataset)
            }
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        let mut descriptor = QueryDescriptor::new(seq, self.session.tag().clone(), request.options);
        descriptor.inputs = request.inputs;
        descriptor.first = request.first;
        descriptor.entries = request.entries;
        descriptor.dataset = dataset;
        descriptor.draw = request.draw;
        self.waiting.push_back(descriptor);
        info!(seq, waiting = self.waiting.len(), "query submitted");
        Ok(seq)
    }

    /// Drain the waiting queue one query at a time, then go back to idle.
    ///
    /// Every queued query runs even if an earlier one fails; the first
    /// failure is returned afterwards.
    pub(super) async fn process_queue(&mut self) -> Result<()> {
        self.session.transition(SessionState::Processing)?;
        let mut first_error = None;
        while self.session.state() == SessionState::Processing {
            let Some(descriptor) = self.waiting.pop_front() else {
                break;
            };
            let seq = descriptor.seq;
            if let Err(err) = self.run_query(descriptor).await {
                warn!(seq, %err, "query failed");
                self.send(Reply::Message {
                    text: format!("Query {seq} failed: {err}"),
                })
                .await;
                first_error.get_or_insert(err);
            }
        }
        if self.session.state() == SessionState::Processing {
            self.send(Reply::SetIdle).await;
            self.session.transition(SessionState::Idle)?;
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn run_query(&mut self, mut descriptor: QueryDescriptor) -> Result<()> {
        let seq = descriptor.seq;
        let log_start = self.log.mark_start()?;
        descriptor.start(
            log_start,
            self.packages.enabled_names(),
            ResourceUsage::snapshot(self.stats.bytes_read),
        )?;
        info!(seq, options = %descriptor.options, "query started");
        self.send(Reply::StartProcess {
            seq,
            entries: descriptor.entries,
        })
        .await;

        let control = ExecutionControl::new();
        let request = ExecRequest {
            seq,
            options: descriptor.options.clone(),
            inputs: descriptor.inputs.clone(),
            dataset: descriptor.dataset.clone(),
            first: descriptor.first,
            entries: descriptor.entries,
            packages: self.packages.enabled_dirs(),
            log: self.log.clone(),
        };
        let mut task = tokio::spawn(self.executor.process(request, control.clone()));
        self.running = Some(RunningQuery {
            control: control.clone(),
            stop_deadline: None,
            summary: descriptor.summary(false),
        });

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            let deadline = self.running.as_ref().and_then(|r| r.stop_deadline);
            let accepting = self.session.state() != SessionState::Terminating;
            let streaming = self.real_time_log;
            tokio::select! {
                biased;
                Some(interrupt) = self.urgent.recv() => {
                    if let Err(err) = self.on_interrupt(interrupt).await {
                        warn!(%err, "interrupt handling failed");
                    }
                }
                joined = &mut task => {
                    break joined.unwrap_or_else(|err| ExecOutcome::aborted(format!("executor task failed: {err}")));
                }
                () = wait_until(deadline) => {
                    warn!(seq, "executor ignored the stop request; aborting");
                    control.abort();
                    task.abort();
                    break ExecOutcome::aborted("stop timeout expired");
                }
                request = self.inbound.recv(), if accepting => match request {
                    Some(request) => self.dispatch(request, true).await,
                    None => {
                        info!("control connection closed during execution");
                        control.abort();
                        self.session.transition(SessionState::Terminating)?;
                    }
                },
                _ = ticker.tick(), if streaming => self.flush_log().await,
            }
        };
        self.running = None;
        self.finalize(descriptor, outcome).await
    }

    async fn finalize(&mut self, mut descriptor: QueryDescriptor, outcome: ExecOutcome) -> Result<()> {
        let seq = descriptor.seq;
        let status = QueryStatus::from(outcome.status);
        self.stats.queries_processed += 1;
        self.stats.bytes_read += outcome.bytes_read;
        descriptor.finished_at = Some(Utc::now());
        descriptor.usage_end = ResourceUsage::snapshot(self.stats.bytes_read);
        descriptor.events_processed = outcome.events;
        descriptor.log_lines = self.log.lines_from(descriptor.log_start)?;
        descriptor.set_status(status)?;
        descriptor.error = outcome.error;
        info!(
            seq,
            ?status,
            events = outcome.events,
            elapsed_ms = u64::try_from(descriptor.elapsed().as_millis()).unwrap_or(u64::MAX),
            "query finished"
        );

        if outcome.status != ExecStatus::Completed {
            self.send(Reply::StopProcess {
                seq,
                events: outcome.events,
                aborted: outcome.status == ExecStatus::Aborted,
            })
            .await;
        }
        if outcome.status == ExecStatus::Aborted {
            let reason = descriptor.error.as_deref().unwrap_or("aborted");
            self.send(Reply::Message {
                text: format!("Query {seq} aborted: {reason}"),
            })
            .await;
            return Ok(());
        }

        self.report_output(seq, status, outcome.events, &outcome.output).await;
        descriptor.output = outcome.output;

        match self.store.save(descriptor)? {
            SaveOutcome::Saved { evicted } if !evicted.is_empty() => {
                debug!(seq, ?evicted, "records evicted to respect the quota");
            }
            SaveOutcome::QuotaExceeded => {
                self.send(Reply::Message {
                    text: QUOTA_EXCEEDED_MESSAGE.into(),
                })
                .await;
            }
            SaveOutcome::Saved { .. } | SaveOutcome::Skipped => {}
        }
        if self.session.is_coordinator() {
            self.enforce_quota().await;
        }
        Ok(())
    }

    async fn report_output(&self, seq: u64, status: QueryStatus, events: u64, output: &[Value]) {
        if self.session.protocol() >= STREAMED_OUTPUT_PROTOCOL {
            self.send(Reply::QueryInfo {
                seq,
                status,
                events,
                objects: output.len(),
            })
            .await;
            for (index, object) in output.iter().enumerate() {
                self.send(Reply::OutputObject {
                    seq,
                    index,
                    last: index + 1 == output.len(),
                    object: object.clone(),
                })
                .await;
            }
        } else {
            self.send(Reply::OutputList {
                seq,
                status,
                objects: output.to_vec(),
            })
            .await;
        }
    }

    /// Signal the running query. Returns whether one was running.
    pub(super) fn stop_running(&mut self, abort: bool, timeout: Option<Duration>) -> bool {
        let Some(running) = self.running.as_mut() else {
            return false;
        };
        if abort {
            running.control.abort();
        } else {
            running.control.stop();
        }
        if let Some(timeout) = timeout {
            running.stop_deadline = Some(Instant::now() + timeout);
        }
        true
    }

    /// Whether a query is executing.
    #[must_use]
    pub fn is_executing(&self) -> bool {
        self.running.is_some()
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

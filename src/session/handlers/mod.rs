//! Operation-code registration table.
//!
//! Each handler receives the coordinator explicitly and the request it
//! should serve. The table is built once at startup; registering an unknown
//! or duplicate code is a configuration error, and [`HandlerTable::standard`]
//! refuses to start unless every known operation has a handler.

mod admin;
mod cache;
mod queries;
mod workers;

use std::collections::HashMap;

use futures_util::future::BoxFuture;

use super::coordinator::SessionCoordinator;
use crate::protocol::{OpCode, Request};
use crate::{AppError, Result};

/// Handler signature.
pub type HandlerFn = for<'a> fn(&'a mut SessionCoordinator, Request) -> BoxFuture<'a, Result<()>>;

/// One registered handler.
#[derive(Clone, Copy)]
pub struct HandlerEntry {
    /// The handler.
    pub handler: HandlerFn,
    /// Whether the handler may run while a query is executing.
    pub during_execution: bool,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("during_execution", &self.during_execution)
            .finish_non_exhaustive()
    }
}

/// Maps operation codes to handlers.
#[derive(Debug, Default)]
pub struct HandlerTable {
    entries: HashMap<u16, HandlerEntry>,
}

impl HandlerTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `code`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `code` is not a known operation or is
    /// already registered.
    pub fn register(&mut self, code: u16, handler: HandlerFn, during_execution: bool) -> Result<()> {
        let Some(op) = OpCode::from_code(code) else {
            return Err(AppError::Config(format!("unknown operation code {code}")));
        };
        if self.entries.contains_key(&code) {
            return Err(AppError::Config(format!("duplicate handler for {op}")));
        }
        self.entries.insert(
            code,
            HandlerEntry {
                handler,
                during_execution,
            },
        );
        Ok(())
    }

    /// Handler for `code`, copied out of the table.
    #[must_use]
    pub fn get(&self, code: u16) -> Option<HandlerEntry> {
        self.entries.get(&code).copied()
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fail unless every known operation has a handler.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first missing operation.
    pub fn ensure_complete(&self) -> Result<()> {
        match OpCode::ALL.into_iter().find(|op| !self.entries.contains_key(&op.code())) {
            Some(missing) => Err(AppError::Config(format!("no handler registered for {missing}"))),
            None => Ok(()),
        }
    }

    /// The table used by every session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the registrations are inconsistent.
    pub fn standard() -> Result<Self> {
        let mut table = Self::new();
        let registrations: [(OpCode, HandlerFn, bool); 19] = [
            (OpCode::Ping, admin::ping, true),
            (OpCode::Status, admin::status, true),
            (OpCode::GetStats, admin::get_stats, true),
            (OpCode::GetParallel, admin::get_parallel, true),
            (OpCode::Protocol, admin::protocol, false),
            (OpCode::Stop, admin::stop, false),
            (OpCode::StopProcess, queries::stop_process, true),
            (OpCode::Process, queries::process, true),
            (OpCode::QueryList, queries::query_list, true),
            (OpCode::Remove, queries::remove, true),
            (OpCode::Retrieve, queries::retrieve, true),
            (OpCode::Archive, queries::archive, true),
            (OpCode::MaxQueries, admin::max_queries, true),
            (OpCode::CleanupSession, queries::cleanup_session, false),
            (OpCode::LogFile, admin::log_file, true),
            (OpCode::Cache, cache::cache, true),
            (OpCode::WorkerLists, workers::worker_lists, false),
            (OpCode::RealTimeLog, admin::real_time_log, false),
            (OpCode::LogLevel, admin::log_level, true),
        ];
        for (op, handler, during_execution) in registrations {
            table.register(op.code(), handler, during_execution)?;
        }
        table.ensure_complete()?;
        Ok(table)
    }
}

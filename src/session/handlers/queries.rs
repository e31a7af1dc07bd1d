//! Query submission and management.

use std::path::PathBuf;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::info;

use crate::protocol::messages::{
    ArchiveRequest, CleanupSessionRequest, ProcessRequest, QueryListRequest, ReferenceRequest,
    StopProcessRequest,
};
use crate::protocol::{Reply, Request};
use crate::query::QueryRef;
use crate::session::coordinator::SessionCoordinator;
use crate::session::model::{SessionState, SessionTag};
use crate::{AppError, Result};

/// Purges the waiting set instead of naming a query.
const CLEANUP_QUEUE: &str = "cleanupqueue";
/// Removes the result directories of every dead session.
const CLEANUP_DIR: &str = "cleanupdir";
/// Archive reference that sets the default archive directory.
const DEFAULT_ARCHIVE: &str = "Default";

pub(super) fn process(node: &mut SessionCoordinator, request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let submission: ProcessRequest = request.payload()?;
        let sync = submission.sync;
        let seq = node.submit(submission)?;
        if !sync || node.session.state() == SessionState::Processing {
            node.send(Reply::QuerySubmitted { seq }).await;
        }
        if node.session.state() == SessionState::Idle {
            node.process_queue().await?;
        }
        Ok(())
    })
}

pub(super) fn stop_process(node: &mut SessionCoordinator, request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let stop: StopProcessRequest = request.payload()?;
        let timeout = stop.timeout_secs.map(Duration::from_secs);
        if node.stop_running(stop.abort, timeout) {
            info!(abort = stop.abort, "running query signalled");
        } else {
            node.note("No query is running");
        }
        node.fan_out(&request).await.into_result()
    })
}

pub(super) fn query_list(node: &mut SessionCoordinator, request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let listing: QueryListRequest = request.payload()?;
        if listing.all {
            node.store.scan_previous()?;
        }
        let mut queries = node.store.summaries(listing.all);
        if let Some(running) = &node.running {
            queries.push(running.summary.clone());
        }
        queries.extend(node.waiting.iter().map(|d| d.summary(false)));
        node.send(Reply::QueryList { queries }).await;
        Ok(())
    })
}

pub(super) fn remove(node: &mut SessionCoordinator, request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let target: ReferenceRequest = request.payload()?;
        match target.reference.trim() {
            CLEANUP_QUEUE => {
                let purged = node.waiting.len();
                node.waiting.clear();
                info!(purged, "waiting queries purged");
                node.note(&format!("Removed {purged} waiting queries"));
            }
            CLEANUP_DIR => {
                let removed = node.store.cleanup_dirs()?;
                node.note(&format!("Removed the results of {removed} finished sessions"));
            }
            raw => {
                let reference: QueryRef = raw.parse()?;
                let seq = reference.seq();
                if reference.is_local_to(node.store.tag()) {
                    if node.running.as_ref().is_some_and(|r| r.summary.seq == seq) {
                        return Err(AppError::Query(format!("query {seq} is running")));
                    }
                    let before = node.waiting.len();
                    node.waiting.retain(|d| d.seq != seq);
                    if node.waiting.len() < before {
                        node.note(&format!("Removed waiting query {seq}"));
                        return Ok(());
                    }
                }
                node.store.remove(&reference)?;
                node.note(&format!("Removed query {reference}"));
            }
        }
        Ok(())
    })
}

pub(super) fn retrieve(node: &mut SessionCoordinator, request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let target: ReferenceRequest = request.payload()?;
        let reference: QueryRef = target.reference.parse()?;
        let query = node.store.retrieve(&reference)?;
        node.send(Reply::Retrieved {
            query: Box::new(query),
        })
        .await;
        Ok(())
    })
}

pub(super) fn archive(node: &mut SessionCoordinator, request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let target: ArchiveRequest = request.payload()?;
        if target.reference.trim() == DEFAULT_ARCHIVE {
            let dir = target.path.trim();
            if dir.is_empty() {
                return Err(AppError::Query("no archive path specified".into()));
            }
            node.store.set_archive_dir(PathBuf::from(dir));
            node.note(&format!("Default archive directory set to {dir}"));
            return Ok(());
        }
        let reference: QueryRef = target.reference.parse()?;
        let path = node.store.archive(&reference, &target.path)?;
        node.send(Reply::Archived { path }).await;
        Ok(())
    })
}

pub(super) fn cleanup_session(node: &mut SessionCoordinator, request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let target: CleanupSessionRequest = request.payload()?;
        let tag = SessionTag::parse(&target.tag)?;
        node.store.cleanup_session(&tag)?;
        node.note(&format!("Removed the results of session {tag}"));
        Ok(())
    })
}

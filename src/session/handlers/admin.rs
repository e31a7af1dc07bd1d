//! Administrative operations: liveness, status, statistics, protocol,
//! log replay and termination.

use futures_util::future::BoxFuture;
use tracing::info;

use crate::protocol::messages::{LogFileRequest, LogLevelRequest, ProtocolRequest, RealTimeLogRequest};
use crate::protocol::{Reply, Request};
use crate::session::coordinator::SessionCoordinator;
use crate::session::model::SessionState;
use crate::Result;

pub(super) fn ping(_node: &mut SessionCoordinator, _request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async { Ok(()) })
}

pub(super) fn status(node: &mut SessionCoordinator, _request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let reply = Reply::Status {
            tag: node.session.tag().to_string(),
            role: node.session.role(),
            ordinal: node.session.ordinal().to_owned(),
            state: node.session.state(),
            protocol: node.session.protocol(),
            waiting: node.waiting.len(),
            running: node.running.as_ref().map(|r| r.summary.seq),
            enabled_packages: node.packages.enabled_names(),
            subordinates: node.subordinates.statuses(),
        };
        node.send(reply).await;
        Ok(())
    })
}

pub(super) fn get_stats(node: &mut SessionCoordinator, _request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let stats = node.stats;
        node.send(Reply::Stats {
            handled: stats.handled,
            queries_processed: stats.queries_processed,
            real_time_secs: stats.real_time.as_secs_f64(),
            cpu_secs: stats.cpu.as_secs_f64(),
            bytes_read: stats.bytes_read,
        })
        .await;
        Ok(())
    })
}

pub(super) fn get_parallel(node: &mut SessionCoordinator, _request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let workers = node.subordinates.active_count().max(1);
        node.send(Reply::Parallel { workers }).await;
        Ok(())
    })
}

pub(super) fn protocol(node: &mut SessionCoordinator, request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let offer: ProtocolRequest = request.payload()?;
        let version = node.session.negotiate_protocol(offer.version)?;
        info!(offered = offer.version, version, "protocol negotiated");
        node.send(Reply::Protocol { version }).await;
        Ok(())
    })
}

pub(super) fn max_queries(node: &mut SessionCoordinator, _request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let max_kept = node.store.max_kept();
        node.send(Reply::MaxQueries { max_kept }).await;
        Ok(())
    })
}

/// Without a start offset only pending output is sent, which the dispatcher
/// flush does anyway.
pub(super) fn log_file(node: &mut SessionCoordinator, request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let range: LogFileRequest = request.payload()?;
        if let Some(start) = range.start {
            let text = node.log.flush(start, range.end)?;
            if !text.is_empty() {
                node.send(Reply::Log { text }).await;
            }
        }
        Ok(())
    })
}

pub(super) fn real_time_log(node: &mut SessionCoordinator, request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let toggle: RealTimeLogRequest = request.payload()?;
        node.real_time_log = toggle.on;
        info!(on = toggle.on, "real-time logging toggled");
        node.fan_out(&request).await.into_result()
    })
}

pub(super) fn log_level(node: &mut SessionCoordinator, request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let change: LogLevelRequest = request.payload()?;
        node.log_level.set(&change.filter)?;
        info!(filter = %change.filter.trim(), "log filter changed");
        node.send(Reply::LogLevel {
            filter: node.log_level.current(),
        })
        .await;
        node.fan_out(&request).await.into_result()
    })
}

pub(super) fn stop(node: &mut SessionCoordinator, request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        info!("stop requested");
        node.session.transition(SessionState::Terminating)?;
        node.fan_out(&request).await.into_result()
    })
}

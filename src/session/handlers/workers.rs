//! Worker-list management.

use futures_util::future::BoxFuture;
use tracing::warn;

use crate::protocol::messages::{WorkerAction, WorkerListsRequest};
use crate::protocol::Request;
use crate::session::coordinator::SessionCoordinator;
use crate::Result;

pub(super) fn worker_lists(node: &mut SessionCoordinator, request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        if !node.session.is_coordinator() {
            warn!("worker lists can only be changed on the coordinator");
            node.note("Warning: worker lists can only be changed on the coordinator");
            return Ok(());
        }
        let change: WorkerListsRequest = request.payload()?;
        let active = change.action == WorkerAction::Activate;
        let changed = node.subordinates.set_active(&change.ordinal, active)?;
        let verb = if active { "Activated" } else { "Deactivated" };
        node.note(&format!("{verb} {changed} workers"));
        Ok(())
    })
}

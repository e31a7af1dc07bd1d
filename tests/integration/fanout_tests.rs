//! Integration tests for a coordinator fanning operations out to in-process
//! subordinate sessions.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use session_node::protocol::messages::{
    LogLevelRequest, RealTimeLogRequest, WorkerAction, WorkerListsRequest,
};
use session_node::protocol::{OpCode, Reply};
use session_node::session::{SubordinateLink, Subordinates};
use session_node::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::test_helpers::{
    assert_ok, done_error, join, spawn_coordinator, ImmediateExecutor, Node, NodeSetup,
};

/// Start subordinates `ordinals` under `root`.
fn children(root: &Path, ordinals: &[&str]) -> (Vec<SubordinateLink>, Vec<JoinHandle<Result<()>>>) {
    let mut links = Vec::new();
    let mut tasks = Vec::new();
    for ordinal in ordinals {
        let (task, peer) = spawn_coordinator(root, NodeSetup::subordinate(ordinal));
        links.push(peer.into_link(*ordinal));
        tasks.push(task);
    }
    (links, tasks)
}

async fn parent(root: &Path, links: Vec<SubordinateLink>, timeout: Duration) -> Node {
    let setup = NodeSetup {
        subordinates: Subordinates::new(links, timeout),
        ..NodeSetup::coordinator(Arc::new(ImmediateExecutor))
    };
    Node::start_in(root, setup).await
}

fn workers(replies: &[Reply]) -> usize {
    replies
        .iter()
        .find_map(|r| match r {
            Reply::Parallel { workers } => Some(*workers),
            _ => None,
        })
        .expect("parallel reply")
}

fn worker_change(action: WorkerAction, ordinal: &str) -> WorkerListsRequest {
    WorkerListsRequest {
        action,
        ordinal: ordinal.into(),
    }
}

/// `Stop` reaches every subordinate and the whole tree terminates.
#[tokio::test]
async fn stop_terminates_the_tree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (links, tasks) = children(dir.path(), &["0.1", "0.2"]);
    let mut node = parent(dir.path(), links, Duration::from_secs(10)).await;

    assert_ok(&node.call_bare(OpCode::Stop).await);

    join(node.task).await.expect("parent");
    for task in tasks {
        join(task).await.expect("subordinate");
    }
}

/// A broadcast succeeds once every subordinate acknowledged it.
#[tokio::test]
async fn real_time_log_fans_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (links, _tasks) = children(dir.path(), &["0.1", "0.2"]);
    let mut node = parent(dir.path(), links, Duration::from_secs(10)).await;

    let replies = node
        .call(OpCode::RealTimeLog, &RealTimeLogRequest { on: true })
        .await;
    assert_ok(&replies);
    assert!(!replies.iter().any(|r| matches!(r, Reply::SessionTag { .. })));
}

/// A log filter change reaches every subordinate.
#[tokio::test]
async fn log_level_fans_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (links, _tasks) = children(dir.path(), &["0.1", "0.2"]);
    let mut node = parent(dir.path(), links, Duration::from_secs(10)).await;

    let replies = node
        .call(
            OpCode::LogLevel,
            &LogLevelRequest {
                filter: "warn".into(),
            },
        )
        .await;
    assert_ok(&replies);
    let changed = replies
        .iter()
        .filter(|r| matches!(r, Reply::LogLevel { filter } if filter == "warn"))
        .count();
    assert_eq!(changed, 3);
}

/// Status reports every direct subordinate.
#[tokio::test]
async fn status_lists_subordinates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (links, _tasks) = children(dir.path(), &["0.1", "0.2"]);
    let mut node = parent(dir.path(), links, Duration::from_secs(10)).await;

    let replies = node.call_bare(OpCode::Status).await;
    let Some(Reply::Status { subordinates, .. }) = replies.iter().find(|r| matches!(r, Reply::Status { .. })) else {
        panic!("no status in {replies:?}");
    };
    let ordinals: Vec<&str> = subordinates.iter().map(|s| s.ordinal.as_str()).collect();
    assert_eq!(ordinals, vec!["0.1", "0.2"]);
    assert!(subordinates.iter().all(|s| s.active));
}

/// Worker lists decide who takes part in fan-out.
#[tokio::test]
async fn worker_lists_control_parallelism() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (links, _tasks) = children(dir.path(), &["0.1", "0.2"]);
    let mut node = parent(dir.path(), links, Duration::from_secs(10)).await;

    assert_eq!(workers(&node.call_bare(OpCode::GetParallel).await), 2);

    assert_ok(
        &node
            .call(OpCode::WorkerLists, &worker_change(WorkerAction::Deactivate, "0.2"))
            .await,
    );
    assert_eq!(workers(&node.call_bare(OpCode::GetParallel).await), 1);

    assert_ok(
        &node
            .call(OpCode::WorkerLists, &worker_change(WorkerAction::Deactivate, "*"))
            .await,
    );
    assert_eq!(workers(&node.call_bare(OpCode::GetParallel).await), 1);

    assert_ok(
        &node
            .call(OpCode::WorkerLists, &worker_change(WorkerAction::Activate, "*"))
            .await,
    );
    assert_eq!(workers(&node.call_bare(OpCode::GetParallel).await), 2);

    let unknown = node
        .call(OpCode::WorkerLists, &worker_change(WorkerAction::Activate, "0.7"))
        .await;
    assert!(done_error(&unknown).contains("0.7"));
}

/// A subordinate that went away fails the broadcast until it is excluded.
#[tokio::test]
async fn dead_subordinate_fails_fan_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (links, mut tasks) = children(dir.path(), &["0.1", "0.2"]);
    let dead = tasks.pop().expect("second child");
    dead.abort();
    assert!(dead.await.is_err());
    let mut node = parent(dir.path(), links, Duration::from_secs(10)).await;

    let replies = node
        .call(OpCode::RealTimeLog, &RealTimeLogRequest { on: true })
        .await;
    let error = done_error(&replies);
    assert!(error.contains("fan-out incomplete"));
    assert!(error.contains("0.2 failed"));

    assert_ok(
        &node
            .call(OpCode::WorkerLists, &worker_change(WorkerAction::Deactivate, "0.2"))
            .await,
    );
    assert_ok(
        &node
            .call(OpCode::RealTimeLog, &RealTimeLogRequest { on: false })
            .await,
    );
}

/// A subordinate that never answers times out.
#[tokio::test]
async fn silent_subordinate_times_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (request_tx, _request_rx) = mpsc::channel(8);
    let (_reply_tx, reply_rx) = mpsc::channel(8);
    let (urgent_tx, _urgent_rx) = mpsc::channel(8);
    let link = SubordinateLink::new("0.1", request_tx, reply_rx, urgent_tx);
    let mut node = parent(dir.path(), vec![link], Duration::from_millis(100)).await;

    let replies = node
        .call(OpCode::RealTimeLog, &RealTimeLogRequest { on: true })
        .await;
    assert!(done_error(&replies).contains("0.1 timed out"));
}

/// Subordinate log output is passed upstream during a broadcast.
#[tokio::test]
async fn subordinate_output_is_forwarded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (links, _tasks) = children(dir.path(), &["0.1"]);
    let mut node = parent(dir.path(), links, Duration::from_secs(10)).await;

    let replies = node
        .call(
            OpCode::Cache,
            &serde_json::json!({"action": "show_cache"}),
        )
        .await;
    assert_ok(&replies);
    let empty_notices = super::test_helpers::log_text(&replies)
        .matches("Cache is empty")
        .count();
    assert_eq!(empty_notices, 2);
}

//! Integration tests for query submission, execution and management.

use std::sync::Arc;

use serde_json::json;
use session_node::protocol::messages::{
    ArchiveRequest, ProcessRequest, ProtocolRequest, QueryListRequest, ReferenceRequest,
    StopProcessRequest, WorkerAction, WorkerListsRequest,
};
use session_node::protocol::{OpCode, Reply};
use session_node::query::descriptor::QueryStatus;

use super::test_helpers::{
    assert_ok, done_error, without_logs, GatedExecutor, ImmediateExecutor, Node, StubbornExecutor,
};

fn submit(sync: bool) -> ProcessRequest {
    ProcessRequest {
        options: "fast".into(),
        sync,
        ..ProcessRequest::default()
    }
}

fn listed(replies: &[Reply]) -> Vec<(u64, QueryStatus)> {
    replies
        .iter()
        .find_map(|r| match r {
            Reply::QueryList { queries } => Some(queries.iter().map(|q| (q.seq, q.status)).collect()),
            _ => None,
        })
        .expect("query list reply")
}

fn reference(seq: u64) -> ReferenceRequest {
    ReferenceRequest {
        reference: seq.to_string(),
    }
}

// ── Execution ───────────────────────────────────────────

/// A synchronous submission on an idle session runs to completion before
/// its `done` arrives.
#[tokio::test]
async fn sync_submission_runs_to_completion() {
    let mut node = Node::start(Arc::new(ImmediateExecutor)).await;

    let replies = without_logs(node.call(OpCode::Process, &submit(true)).await);

    assert_eq!(replies[0], Reply::StartProcess { seq: 1, entries: -1 });
    assert_eq!(
        replies[1],
        Reply::QueryInfo {
            seq: 1,
            status: QueryStatus::Completed,
            events: 100,
            objects: 2,
        }
    );
    assert!(matches!(replies[2], Reply::OutputObject { index: 0, last: false, .. }));
    assert!(matches!(replies[3], Reply::OutputObject { index: 1, last: true, .. }));
    assert_eq!(replies[4], Reply::SetIdle);
    assert_ok(&replies);
    assert_eq!(replies.len(), 6);
    node.close().await.expect("clean shutdown");
}

/// An asynchronous submission is acknowledged with its sequence number first.
#[tokio::test]
async fn async_submission_is_acknowledged() {
    let mut node = Node::start(Arc::new(ImmediateExecutor)).await;

    let replies = without_logs(node.call(OpCode::Process, &submit(false)).await);

    assert_eq!(replies[0], Reply::QuerySubmitted { seq: 1 });
    assert_eq!(replies[1], Reply::StartProcess { seq: 1, entries: -1 });
    assert_ok(&replies);
}

/// Older peers get all output objects in one reply.
#[tokio::test]
async fn negotiated_old_protocol_gets_output_list() {
    let mut node = Node::start(Arc::new(ImmediateExecutor)).await;
    let negotiated = node
        .call(OpCode::Protocol, &ProtocolRequest { version: 10 })
        .await;
    assert!(negotiated.contains(&Reply::Protocol { version: 10 }));

    let replies = without_logs(node.call(OpCode::Process, &submit(true)).await);

    assert!(replies.iter().any(|r| matches!(
        r,
        Reply::OutputList { seq: 1, status: QueryStatus::Completed, objects } if objects.len() == 2
    )));
    assert!(!replies.iter().any(|r| matches!(r, Reply::QueryInfo { .. })));
}

/// Submissions arriving while a query runs are queued and run in order.
#[tokio::test]
async fn submissions_during_execution_are_queued() {
    let (executor, gate) = GatedExecutor::new();
    let mut node = Node::start(Arc::new(executor)).await;

    let first = node.send(OpCode::Process, &submit(true)).await;
    node.until(|r| matches!(r, Reply::StartProcess { seq: 1, .. })).await;

    let second = without_logs(node.call(OpCode::Process, &submit(true)).await);
    assert_eq!(second[0], Reply::QuerySubmitted { seq: 2 });
    assert_ok(&second);

    let listing = node.call(OpCode::QueryList, &QueryListRequest::default()).await;
    assert_eq!(
        listed(&listing),
        vec![(1, QueryStatus::Running), (2, QueryStatus::Waiting)]
    );

    gate.notify_one();
    node.until(|r| matches!(r, Reply::StartProcess { seq: 2, .. })).await;
    gate.notify_one();
    let rest = without_logs(node.until_done(first).await);
    assert_eq!(rest.iter().filter(|r| **r == Reply::SetIdle).count(), 1);
    assert_ok(&rest);

    let listing = node.call(OpCode::QueryList, &QueryListRequest::default()).await;
    assert_eq!(
        listed(&listing),
        vec![(1, QueryStatus::Completed), (2, QueryStatus::Completed)]
    );
}

/// Operations that are unsafe during execution are refused, not queued.
#[tokio::test]
async fn restricted_operation_is_refused() {
    let (executor, gate) = GatedExecutor::new();
    let mut node = Node::start(Arc::new(executor)).await;

    let first = node.send(OpCode::Process, &submit(true)).await;
    node.until(|r| matches!(r, Reply::StartProcess { .. })).await;

    let change = WorkerListsRequest {
        action: WorkerAction::Deactivate,
        ordinal: "*".into(),
    };
    let refused = node.call(OpCode::WorkerLists, &change).await;
    assert!(done_error(&refused).contains("not allowed while a query is running"));
    assert_ok(&node.call_bare(OpCode::Ping).await);

    gate.notify_one();
    assert_ok(&node.until_done(first).await);
    assert_ok(&node.call(OpCode::WorkerLists, &change).await);
}

/// Administrative reads answer while a query runs.
#[tokio::test]
async fn administrative_reads_during_execution() {
    let (executor, gate) = GatedExecutor::new();
    let mut node = Node::start(Arc::new(executor)).await;

    let first = node.send(OpCode::Process, &submit(true)).await;
    node.until(|r| matches!(r, Reply::StartProcess { .. })).await;

    let parallel = node.call_bare(OpCode::GetParallel).await;
    assert!(parallel.contains(&Reply::Parallel { workers: 1 }));
    let quota = node.call_bare(OpCode::MaxQueries).await;
    assert!(quota.contains(&Reply::MaxQueries { max_kept: -1 }));
    assert_ok(&node.call_bare(OpCode::GetStats).await);

    gate.notify_one();
    assert_ok(&node.until_done(first).await);
}

// ── Stop and abort ──────────────────────────────────────

/// A soft stop keeps the partial result.
#[tokio::test]
async fn soft_stop_keeps_partial_result() {
    let (executor, _gate) = GatedExecutor::new();
    let mut node = Node::start(Arc::new(executor)).await;

    let first = node.send(OpCode::Process, &submit(true)).await;
    node.until(|r| matches!(r, Reply::StartProcess { .. })).await;
    assert_ok(&node.call(OpCode::StopProcess, &StopProcessRequest::default()).await);

    let rest = without_logs(node.until_done(first).await);
    assert_eq!(
        rest[0],
        Reply::StopProcess {
            seq: 1,
            events: 5,
            aborted: false
        }
    );
    assert!(rest.iter().any(|r| matches!(
        r,
        Reply::QueryInfo { status: QueryStatus::Stopped, events: 5, .. }
    )));
    assert_ok(&rest);

    let retrieved = node.call(OpCode::Retrieve, &reference(1)).await;
    let Some(Reply::Retrieved { query }) = retrieved.iter().find(|r| matches!(r, Reply::Retrieved { .. })) else {
        panic!("no record in {retrieved:?}");
    };
    assert_eq!(query.status, QueryStatus::Stopped);
    assert_eq!(query.output, vec![json!({"partial": true})]);
}

/// An aborted query is reported and never persisted.
#[tokio::test]
async fn abort_discards_query() {
    let (executor, _gate) = GatedExecutor::new();
    let mut node = Node::start(Arc::new(executor)).await;

    let first = node.send(OpCode::Process, &submit(true)).await;
    node.until(|r| matches!(r, Reply::StartProcess { .. })).await;
    let abort = StopProcessRequest {
        abort: true,
        timeout_secs: None,
    };
    assert_ok(&node.call(OpCode::StopProcess, &abort).await);

    let rest = without_logs(node.until_done(first).await);
    assert!(rest.contains(&Reply::StopProcess {
        seq: 1,
        events: 0,
        aborted: true
    }));
    assert!(rest.iter().any(|r| matches!(
        r,
        Reply::Message { text } if text == "Query 1 aborted: aborted on request"
    )));
    assert!(!rest.iter().any(|r| matches!(r, Reply::QueryInfo { .. })));

    let listing = node.call(OpCode::QueryList, &QueryListRequest::default()).await;
    assert!(listed(&listing).is_empty());
}

/// An executor that ignores a stop is abandoned when the timeout expires.
#[tokio::test]
async fn stop_timeout_escalates_to_abort() {
    let mut node = Node::start(Arc::new(StubbornExecutor::default())).await;

    let first = node.send(OpCode::Process, &submit(true)).await;
    node.until(|r| matches!(r, Reply::StartProcess { .. })).await;
    let stop = StopProcessRequest {
        abort: false,
        timeout_secs: Some(0),
    };
    assert_ok(&node.call(OpCode::StopProcess, &stop).await);

    let rest = without_logs(node.until_done(first).await);
    assert!(rest.iter().any(|r| matches!(
        r,
        Reply::Message { text } if text.contains("stop timeout expired")
    )));
    assert!(rest.iter().any(|r| matches!(r, Reply::StopProcess { aborted: true, .. })));
    assert_ok(&rest);
}

/// Stopping with nothing running is harmless.
#[tokio::test]
async fn stop_without_query_is_noop() {
    let mut node = Node::start(Arc::new(ImmediateExecutor)).await;
    let replies = node.call(OpCode::StopProcess, &StopProcessRequest::default()).await;
    assert_ok(&replies);
    assert!(super::test_helpers::log_text(&replies).contains("No query is running"));
}

// ── Management ──────────────────────────────────────────

/// `cleanupqueue` purges waiting queries; the running one cannot be removed.
#[tokio::test]
async fn remove_waiting_and_running() {
    let (executor, gate) = GatedExecutor::new();
    let mut node = Node::start(Arc::new(executor)).await;

    let first = node.send(OpCode::Process, &submit(true)).await;
    node.until(|r| matches!(r, Reply::StartProcess { .. })).await;
    assert_ok(&node.call(OpCode::Process, &submit(false)).await);
    assert_ok(&node.call(OpCode::Process, &submit(false)).await);

    let running = node.call(OpCode::Remove, &reference(1)).await;
    assert!(done_error(&running).contains("query 1 is running"));

    let removed = node
        .call(
            OpCode::Remove,
            &ReferenceRequest {
                reference: "cleanupqueue".into(),
            },
        )
        .await;
    assert_ok(&removed);
    let listing = node.call(OpCode::QueryList, &QueryListRequest::default()).await;
    assert_eq!(listed(&listing), vec![(1, QueryStatus::Running)]);

    gate.notify_one();
    let rest = without_logs(node.until_done(first).await);
    assert!(!rest.iter().any(|r| matches!(r, Reply::StartProcess { .. })));
    assert_ok(&rest);

    assert_ok(&node.call(OpCode::Remove, &reference(1)).await);
    let listing = node.call(OpCode::QueryList, &QueryListRequest::default()).await;
    assert!(listed(&listing).is_empty());
}

/// Finished queries can be retrieved and archived to an explicit path or the
/// default archive directory.
#[tokio::test]
async fn retrieve_and_archive() {
    let mut node = Node::start(Arc::new(ImmediateExecutor)).await;
    assert_ok(&node.call(OpCode::Process, &submit(true)).await);

    let retrieved = node.call(OpCode::Retrieve, &reference(1)).await;
    assert!(retrieved.iter().any(|r| matches!(
        r,
        Reply::Retrieved { query } if query.seq == 1 && query.output.len() == 2
    )));

    let target = node.root.join("exported.json");
    let archived = node
        .call(
            OpCode::Archive,
            &ArchiveRequest {
                reference: "1".into(),
                path: target.display().to_string(),
            },
        )
        .await;
    assert!(archived.contains(&Reply::Archived { path: target.clone() }));
    assert!(target.is_file());

    let no_default = node
        .call(
            OpCode::Archive,
            &ArchiveRequest {
                reference: "1".into(),
                path: String::new(),
            },
        )
        .await;
    assert!(done_error(&no_default).contains("no archive path"));

    let archive_dir = node.root.join("archive");
    std::fs::create_dir_all(&archive_dir).expect("mkdir");
    assert_ok(
        &node
            .call(
                OpCode::Archive,
                &ArchiveRequest {
                    reference: "Default".into(),
                    path: archive_dir.display().to_string(),
                },
            )
            .await,
    );
    let archived = node
        .call(
            OpCode::Archive,
            &ArchiveRequest {
                reference: "1".into(),
                path: String::new(),
            },
        )
        .await;
    let expected = archive_dir.join(format!("session-{}-1.json", node.tag));
    assert!(archived.contains(&Reply::Archived { path: expected.clone() }));
    assert!(expected.is_file());
}

/// Unknown references fail the request.
#[tokio::test]
async fn retrieve_unknown_query_fails() {
    let mut node = Node::start(Arc::new(ImmediateExecutor)).await;
    let replies = node.call(OpCode::Retrieve, &reference(42)).await;
    assert!(!done_error(&replies).is_empty());
}

/// Draw queries run but leave no record behind.
#[tokio::test]
async fn draw_query_is_not_persisted() {
    let mut node = Node::start(Arc::new(ImmediateExecutor)).await;
    let draw = ProcessRequest {
        draw: true,
        ..submit(true)
    };
    let replies = without_logs(node.call(OpCode::Process, &draw).await);
    assert!(replies.iter().any(|r| matches!(r, Reply::QueryInfo { seq: 1, .. })));

    let retrieved = node.call(OpCode::Retrieve, &reference(1)).await;
    assert!(!done_error(&retrieved).is_empty());
}

/// Records of finished queries count against the quota.
#[tokio::test]
async fn quota_evicts_oldest_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut setup = super::test_helpers::NodeSetup::coordinator(Arc::new(ImmediateExecutor));
    setup.max_queries = 1;
    let mut node = Node::start_in(dir.path(), setup).await;

    assert_ok(&node.call(OpCode::Process, &submit(true)).await);
    assert_ok(&node.call(OpCode::Process, &submit(true)).await);

    assert!(!done_error(&node.call(OpCode::Retrieve, &reference(1)).await).is_empty());
    assert_ok(&node.call(OpCode::Retrieve, &reference(2)).await);
    node.close().await.expect("clean shutdown");
}

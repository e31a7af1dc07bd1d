//! Unit tests for the NDJSON reader and writer tasks.

use session_node::protocol::{OpCode, Reply, Request};
use session_node::transport::wire::{run_reader, run_writer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Malformed and blank lines are skipped; valid ones arrive in order.
#[tokio::test]
async fn reader_skips_malformed_lines() {
    let (mut near, far) = tokio::io::duplex(4096);
    let (tx, mut rx) = mpsc::channel::<Request>(8);
    let reader = tokio::spawn(run_reader("test".into(), far, tx, CancellationToken::new()));

    near.write_all(b"{\"code\": 1, \"id\": 1}\nnot json\n\n{\"code\": 2}\n")
        .await
        .expect("write");
    drop(near);

    let first = rx.recv().await.expect("first");
    assert_eq!(first.op(), Some(OpCode::Ping));
    assert_eq!(first.id, Some(1));
    let second = rx.recv().await.expect("second");
    assert_eq!(second.op(), Some(OpCode::Status));

    // EOF ends the reader and closes the channel.
    assert!(rx.recv().await.is_none());
    reader.await.expect("join").expect("reader");
}

/// A final line without a newline is still delivered at EOF.
#[tokio::test]
async fn reader_accepts_unterminated_last_line() {
    let (mut near, far) = tokio::io::duplex(4096);
    let (tx, mut rx) = mpsc::channel::<Request>(8);
    tokio::spawn(run_reader("test".into(), far, tx, CancellationToken::new()));

    near.write_all(b"{\"code\": 3}").await.expect("write");
    drop(near);

    assert_eq!(rx.recv().await.expect("request").op(), Some(OpCode::GetStats));
}

#[tokio::test]
async fn reader_stops_on_cancel() {
    let (_near, far) = tokio::io::duplex(64);
    let (tx, mut rx) = mpsc::channel::<Request>(8);
    let cancel = CancellationToken::new();
    let reader = tokio::spawn(run_reader("test".into(), far, tx, cancel.clone()));

    cancel.cancel();
    reader.await.expect("join").expect("reader");
    assert!(rx.recv().await.is_none());
}

/// Each message becomes exactly one line.
#[tokio::test]
async fn writer_emits_one_line_per_message() {
    let (near, mut far) = tokio::io::duplex(4096);
    let (tx, rx) = mpsc::channel::<Reply>(8);
    let writer = tokio::spawn(run_writer("test".into(), near, rx, CancellationToken::new()));

    tx.send(Reply::SetIdle).await.expect("send");
    tx.send(Reply::Log {
        text: "two\nlines".into(),
    })
    .await
    .expect("send");
    drop(tx);
    writer.await.expect("join").expect("writer");

    let mut out = String::new();
    far.read_to_string(&mut out).await.expect("read");
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], r#"{"kind":"set_idle"}"#);
    let log: Reply = serde_json::from_str(lines[1]).expect("parse");
    assert_eq!(
        log,
        Reply::Log {
            text: "two\nlines".into()
        }
    );
}

/// A writer whose peer is gone reports a transport error.
#[tokio::test]
async fn writer_fails_when_peer_closed() {
    let (near, far) = tokio::io::duplex(8);
    drop(far);
    let (tx, rx) = mpsc::channel::<Reply>(8);
    let writer = tokio::spawn(run_writer("test".into(), near, rx, CancellationToken::new()));

    tx.send(Reply::SetIdle).await.expect("send");
    let result = writer.await.expect("join");
    assert!(result.is_err());
}

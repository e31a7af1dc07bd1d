//! Unit tests for the per-session `LogChannel`.

use session_node::log_channel::LogChannel;

fn open() -> (tempfile::TempDir, LogChannel) {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = LogChannel::open(dir.path().join("session.log")).expect("open log");
    (dir, log)
}

/// Live flushes return each appended byte exactly once.
#[test]
fn flush_live_delivers_once() {
    let (_dir, log) = open();
    log.append_line("first").expect("append");
    log.append_line("second\n").expect("append");

    assert_eq!(log.flush_live().expect("flush"), "first\nsecond\n");
    assert_eq!(log.flush_live().expect("flush"), "");

    log.append(b"partial").expect("append");
    assert_eq!(log.flush_live().expect("flush"), "partial");
}

/// Ranged replays do not move the live cursor.
#[test]
fn ranged_flush_leaves_cursor() {
    let (_dir, log) = open();
    log.append_line("before").expect("append");
    let start = log.mark_start().expect("mark");
    log.append_line("during").expect("append");
    let end = log.mark_start().expect("mark");
    log.append_line("after").expect("append");

    assert_eq!(log.flush(start, Some(end)).expect("flush"), "during\n");
    assert_eq!(log.flush(start, None).expect("flush"), "during\nafter\n");
    assert_eq!(log.cursor().expect("cursor"), 0);
    assert_eq!(log.flush_live().expect("flush"), "before\nduring\nafter\n");
}

/// Out-of-range bounds clamp instead of failing.
#[test]
fn flush_clamps_bounds() {
    let (_dir, log) = open();
    log.append_line("abc").expect("append");

    assert_eq!(log.flush(100, None).expect("flush"), "");
    assert_eq!(log.flush(0, Some(1000)).expect("flush"), "abc\n");
    assert_eq!(log.flush(2, Some(1)).expect("flush"), "c\n");
}

/// Content present before opening counts as delivered.
#[test]
fn reopen_starts_at_end() {
    let (dir, log) = open();
    log.append_line("old run").expect("append");
    drop(log);

    let log = LogChannel::open(dir.path().join("session.log")).expect("reopen");
    assert_eq!(log.flush_live().expect("flush"), "");
    log.append_line("new run").expect("append");
    assert_eq!(log.flush_live().expect("flush"), "new run\n");
}

/// `skip_to_end` drops pending output.
#[test]
fn skip_to_end_drops_pending() {
    let (_dir, log) = open();
    log.append_line("noise").expect("append");
    log.skip_to_end().expect("skip");
    assert_eq!(log.flush_live().expect("flush"), "");
}

/// Lines appended after an offset are split for query records.
#[test]
fn lines_from_offset() {
    let (_dir, log) = open();
    log.append_line("setup").expect("append");
    let start = log.mark_start().expect("mark");
    log.append_line("event 1").expect("append");
    log.append_line("event 2").expect("append");

    assert_eq!(
        log.lines_from(start).expect("lines"),
        vec!["event 1".to_owned(), "event 2".to_owned()]
    );
}

/// Clones share one file and one cursor.
#[test]
fn clones_share_state() {
    let (_dir, log) = open();
    let other = log.clone();
    other.append_line("from clone").expect("append");
    assert_eq!(log.flush_live().expect("flush"), "from clone\n");
    assert_eq!(other.flush_live().expect("flush"), "");
}

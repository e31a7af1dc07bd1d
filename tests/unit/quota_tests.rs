//! Unit tests for cross-session quota reconciliation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use session_node::query::quota::reconcile;
use session_node::query::store::RECORD_FILE;
use session_node::session::SessionTag;

fn tag(pid: u32) -> SessionTag {
    SessionTag::from_parts("0", "host", 1_700_000_000, pid)
}

/// Write a record for `seq` of `owner` with a fixed modification time.
fn write_record(root: &Path, owner: &SessionTag, seq: u64, age_rank: u64) -> PathBuf {
    let dir = root.join(owner.dir_name()).join(seq.to_string());
    fs::create_dir_all(&dir).expect("mkdir");
    let file = dir.join(RECORD_FILE);
    fs::write(&file, b"{}").expect("write");
    let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 + age_rank);
    fs::File::options()
        .write(true)
        .open(&file)
        .expect("open")
        .set_modified(mtime)
        .expect("set mtime");
    dir
}

/// Everything beyond the newest records of other sessions is deleted, and
/// emptied session directories go with it.
#[test]
fn keeps_newest_records() {
    let root = tempfile::tempdir().expect("tempdir");
    let a = tag(1);
    let b = tag(2);
    let oldest = write_record(root.path(), &a, 1, 1);
    let newer = write_record(root.path(), &b, 1, 2);
    let newest = write_record(root.path(), &b, 2, 3);

    let report = reconcile(root.path(), &tag(9), 2).expect("reconcile");

    assert_eq!(report.inspected, 3);
    assert_eq!(report.removed, vec![oldest]);
    assert_eq!(report.removed_sessions, vec![root.path().join(a.dir_name())]);
    assert!(newer.exists());
    assert!(newest.exists());
}

/// The current session's records are never counted or evicted.
#[test]
fn ignores_own_session() {
    let root = tempfile::tempdir().expect("tempdir");
    let own = tag(1);
    let mine = write_record(root.path(), &own, 1, 1);
    let theirs = write_record(root.path(), &tag(2), 1, 2);

    let report = reconcile(root.path(), &own, 0).expect("reconcile");

    assert_eq!(report.inspected, 1);
    assert_eq!(report.removed, vec![theirs]);
    assert!(mine.exists());
}

/// A record directory without a readable record file is removed outright.
#[test]
fn removes_unreadable_records() {
    let root = tempfile::tempdir().expect("tempdir");
    let broken = root.path().join(tag(2).dir_name()).join("4");
    fs::create_dir_all(&broken).expect("mkdir");

    let report = reconcile(root.path(), &tag(1), 10).expect("reconcile");

    assert_eq!(report.removed, vec![broken.clone()]);
    assert!(!broken.exists());
}

/// A negative quota disables eviction.
#[test]
fn negative_quota_is_noop() {
    let root = tempfile::tempdir().expect("tempdir");
    let kept = write_record(root.path(), &tag(2), 1, 1);

    let report = reconcile(root.path(), &tag(1), -1).expect("reconcile");

    assert_eq!(report.inspected, 0);
    assert!(report.removed.is_empty());
    assert!(kept.exists());
}

/// Entries that are not session directories are left alone.
#[test]
fn ignores_foreign_entries() {
    let root = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(root.path().join("scratch").join("1")).expect("mkdir");
    fs::write(root.path().join("notes.txt"), b"x").expect("write");

    let report = reconcile(root.path(), &tag(1), 0).expect("reconcile");

    assert_eq!(report.inspected, 0);
    assert!(root.path().join("scratch").exists());
    assert!(root.path().join("notes.txt").exists());
}

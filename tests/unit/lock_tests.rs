//! Unit tests for the advisory `LockGuard`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use session_node::lock::{lock_file_name, LockGuard};
use session_node::AppError;

/// Lock file names flatten the guarded path so every process derives the
/// same name.
#[test]
fn lock_file_name_flattens_path() {
    let name = lock_file_name("node-cache-lock-", Path::new("/srv/node/cache"));
    assert_eq!(name, "node-cache-lock-%srv%node%cache");
}

/// A free lock is acquired and released.
#[test]
fn acquire_and_release() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut guard = LockGuard::new(dir.path().join("a.lock"));

    guard.acquire().expect("acquire");
    assert!(guard.is_held());
    assert_eq!(guard.holder().expect("owner metadata").pid, std::process::id());
    assert!(guard.holder_alive());

    guard.release().expect("release");
    assert!(!guard.is_held());
    assert!(guard.holder().is_none());
}

/// Releasing an unheld guard is a no-op.
#[test]
fn release_unheld_is_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut guard = LockGuard::new(dir.path().join("a.lock"));
    guard.release().expect("release");
}

/// The lock is not reentrant.
#[test]
fn reacquire_on_same_guard_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut guard = LockGuard::new(dir.path().join("a.lock"));
    guard.acquire().expect("acquire");

    let err = guard.try_acquire().expect_err("must fail");
    assert!(matches!(err, AppError::Lock(ref msg) if msg.contains("already held")));
}

/// A second guard over the same file sees the lock as taken.
#[test]
fn contended_try_acquire_returns_false() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("a.lock");
    let mut first = LockGuard::new(path.clone());
    let mut second = LockGuard::new(path);

    first.acquire().expect("acquire");
    assert!(!second.try_acquire().expect("probe"));

    first.release().expect("release");
    assert!(second.try_acquire().expect("probe"));
}

/// Waiting for a held lock gives up at the timeout and names the holder.
#[tokio::test]
async fn acquire_timeout_expires() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("a.lock");
    let mut holder = LockGuard::new(path.clone());
    let mut waiter = LockGuard::new(path);
    holder.acquire().expect("acquire");

    let started = Instant::now();
    let err = waiter
        .acquire_timeout(Duration::from_millis(150))
        .await
        .expect_err("must time out");
    assert!(started.elapsed() >= Duration::from_millis(150));
    match err {
        AppError::Lock(msg) => {
            assert!(msg.contains("timed out"), "{msg}");
            assert!(msg.contains(&format!("pid {}", std::process::id())), "{msg}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Other tasks keep running while a waiter polls for the lock.
#[tokio::test]
async fn acquire_timeout_yields_to_runtime() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("a.lock");
    let mut holder = LockGuard::new(path.clone());
    let mut waiter = LockGuard::new(path);
    holder.acquire().expect("acquire");

    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        holder.release().expect("release");
    });
    waiter
        .acquire_timeout(Duration::from_secs(5))
        .await
        .expect("acquired once the holder let go");
    assert!(waiter.is_held());
    releaser.await.expect("releaser");
}

/// Threads racing for one lock file are never inside together.
#[test]
fn acquire_is_mutually_exclusive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("a.lock");
    let inside = Arc::new(AtomicBool::new(false));
    let entries = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            let inside = Arc::clone(&inside);
            let entries = Arc::clone(&entries);
            thread::spawn(move || {
                let mut guard = LockGuard::new(path);
                for _ in 0..20 {
                    guard.acquire().expect("acquire");
                    assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                    entries.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(1));
                    inside.store(false, Ordering::SeqCst);
                    guard.release().expect("release");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }
    assert_eq!(entries.load(Ordering::SeqCst), 80);
}

/// A waiter blocked on a lock file that gets unlinked moves over to the
/// new file instead of holding the old one alongside a new holder.
#[test]
fn waiter_follows_replaced_lock_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("a.lock");
    let mut first = LockGuard::new(path.clone());
    first.acquire().expect("acquire");

    let (acquired_tx, acquired_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let waiter_path = path.clone();
    let waiter = thread::spawn(move || {
        let mut guard = LockGuard::new(waiter_path);
        guard.acquire().expect("acquire");
        acquired_tx.send(()).expect("signal");
        done_rx.recv().ok();
    });
    thread::sleep(Duration::from_millis(100));
    first.release_and_remove().expect("remove");

    acquired_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("waiter acquired");
    let mut late = LockGuard::new(path);
    assert!(!late.try_acquire().expect("probe"), "waiter must hold the linked file");

    done_tx.send(()).expect("finish");
    waiter.join().expect("waiter");
    assert!(late.try_acquire().expect("probe"));
}

/// Dropping a guard releases its lock.
#[test]
fn drop_releases() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("a.lock");
    {
        let mut guard = LockGuard::new(path.clone());
        guard.acquire().expect("acquire");
    }
    let mut again = LockGuard::new(path);
    assert!(again.try_acquire().expect("probe"));
}

/// `release_and_remove` unlinks the lock file.
#[test]
fn release_and_remove_unlinks_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut guard = LockGuard::for_path(dir.path(), "p-", Path::new("x"));
    guard.acquire().expect("acquire");
    let lock_path = guard.path().to_path_buf();
    assert!(lock_path.exists());

    guard.release_and_remove().expect("remove");
    assert!(!lock_path.exists());
}

/// Dropping an `AreaLock` frees the area for the next holder.
#[tokio::test]
async fn area_lock_released_on_drop() {
    use session_node::areas::{AreaKind, ResourceArea};

    let dir = tempfile::tempdir().expect("tempdir");
    let locks = dir.path().join("locks");
    std::fs::create_dir_all(&locks).expect("lock dir");
    let open = || {
        ResourceArea::open(
            AreaKind::Cache,
            dir.path().join("cache"),
            &locks,
            Duration::from_millis(100),
        )
        .expect("open area")
    };
    let mut first = open();
    let mut second = open();

    let held = first.lock().await.expect("first lock");
    let err = second.lock().await.expect_err("area is held");
    assert!(matches!(err, AppError::Lock(_)), "got {err:?}");
    drop(held);

    let _again = second.lock().await.expect("lock after drop");
}

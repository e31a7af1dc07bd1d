//! Unit tests for `PackageRegistry` with scripted package actions.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use session_node::areas::{AreaKind, ResourceArea};
use session_node::log_channel::LogChannel;
use session_node::packages::registry::{sha256_file, CHECKSUM_FILE};
use session_node::packages::{EnableOutcome, InstallOutcome, PackageActions, PackageRegistry};
use session_node::{AppError, Result};

/// Unpacks by creating `<dest>/<name>/PKG-INF` and counts every call.
#[derive(Default)]
struct FakeActions {
    unpacks: AtomicUsize,
    setups: AtomicUsize,
    fail_setup: bool,
}

impl PackageActions for FakeActions {
    fn unpack<'a>(
        &'a self,
        archive: &'a Path,
        dest_parent: &'a Path,
        _log: &'a LogChannel,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.unpacks.fetch_add(1, Ordering::SeqCst);
            let name = archive.file_stem().expect("archive name");
            fs::create_dir_all(dest_parent.join(name).join("PKG-INF"))?;
            Ok(())
        })
    }

    fn build<'a>(&'a self, _dir: &'a Path, _log: &'a LogChannel) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn setup<'a>(&'a self, _dir: &'a Path, _log: &'a LogChannel) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.setups.fetch_add(1, Ordering::SeqCst);
            if self.fail_setup {
                Err(AppError::Package("setup script exited with 1".into()))
            } else {
                Ok(())
            }
        })
    }
}

struct Fixture {
    root: tempfile::TempDir,
    actions: Arc<FakeActions>,
    registry: PackageRegistry,
}

fn fixture_with(actions: FakeActions, global_dirs: Vec<PathBuf>) -> Fixture {
    let root = tempfile::tempdir().expect("tempdir");
    let area = ResourceArea::open(
        AreaKind::Packages,
        root.path().join("packages"),
        &root.path().join("locks"),
        Duration::from_secs(1),
    )
    .expect("open area");
    let log = LogChannel::open(root.path().join("session.log")).expect("log");
    let actions = Arc::new(actions);
    let registry = PackageRegistry::new(area, global_dirs, actions.clone(), log);
    Fixture {
        root,
        actions,
        registry,
    }
}

fn fixture() -> Fixture {
    fixture_with(FakeActions::default(), Vec::new())
}

/// Write an archive outside the package area and return its path and
/// checksum.
fn source_archive(root: &Path, name: &str, contents: &[u8]) -> (PathBuf, String) {
    let dir = root.join("incoming");
    fs::create_dir_all(&dir).expect("mkdir");
    let path = dir.join(format!("{name}.par"));
    fs::write(&path, contents).expect("write archive");
    let checksum = sha256_file(&path).expect("hash");
    (path, checksum)
}

// ── Install ─────────────────────────────────────────────

/// The checksum guards installation.
#[tokio::test]
async fn install_rejects_checksum_mismatch() {
    let mut fx = fixture();
    let (archive, actual) = source_archive(fx.root.path(), "tools", b"v1");

    let outcome = fx
        .registry
        .install("tools", "deadbeef", Some(&archive))
        .await
        .expect("install");

    assert_eq!(
        outcome,
        InstallOutcome::ChecksumMismatch {
            expected: "deadbeef".into(),
            actual,
        }
    );
    assert_eq!(fx.actions.unpacks.load(Ordering::SeqCst), 0);
}

/// A matching checksum on disk makes reinstalling a no-op.
#[tokio::test]
async fn install_is_idempotent() {
    let mut fx = fixture();
    let (archive, checksum) = source_archive(fx.root.path(), "tools", b"v1");

    let first = fx
        .registry
        .install("tools", &checksum, Some(&archive))
        .await
        .expect("install");
    let second = fx
        .registry
        .install("tools", &checksum, None)
        .await
        .expect("install");

    assert_eq!(first, InstallOutcome::Ok { unpacked: true });
    assert_eq!(second, InstallOutcome::Ok { unpacked: false });
    assert_eq!(fx.actions.unpacks.load(Ordering::SeqCst), 1);
    let recorded = fs::read_to_string(
        fx.registry
            .dir()
            .join("tools")
            .join("PKG-INF")
            .join(CHECKSUM_FILE),
    )
    .expect("checksum file");
    assert_eq!(recorded, checksum);
}

/// Without an archive there is nothing to unpack.
#[tokio::test]
async fn install_without_archive_fails() {
    let mut fx = fixture();
    let outcome = fx
        .registry
        .install("ghost", "00", None)
        .await
        .expect("install");
    assert!(matches!(outcome, InstallOutcome::UnpackFailure(_)));
}

/// Path-like names are refused.
#[tokio::test]
async fn install_rejects_bad_names() {
    let mut fx = fixture();
    for name in ["", "..", "../escape", ".hidden", "a/b"] {
        let err = fx
            .registry
            .install(name, "00", None)
            .await
            .expect_err("bad name");
        assert!(matches!(err, AppError::Package(_)), "{name}");
    }
}

/// Reinstalling a changed archive leaves the package disabled.
#[tokio::test]
async fn reinstall_resets_enabled() {
    let mut fx = fixture();
    let (archive, checksum) = source_archive(fx.root.path(), "tools", b"v1");
    fx.registry
        .install("tools", &checksum, Some(&archive))
        .await
        .expect("install");
    assert_eq!(
        fx.registry.enable("tools").await.expect("enable"),
        EnableOutcome::Ok
    );

    let (archive, checksum) = source_archive(fx.root.path(), "tools", b"v2");
    let outcome = fx
        .registry
        .install("tools", &checksum, Some(&archive))
        .await
        .expect("install");

    assert_eq!(outcome, InstallOutcome::Ok { unpacked: true });
    assert!(fx.registry.enabled_names().is_empty());
}

// ── Enable and unload ───────────────────────────────────

/// Setup runs once per session, however often the package is toggled.
#[tokio::test]
async fn enable_runs_setup_once() {
    let mut fx = fixture();
    let (archive, checksum) = source_archive(fx.root.path(), "tools", b"v1");
    fx.registry
        .install("tools", &checksum, Some(&archive))
        .await
        .expect("install");

    assert_eq!(
        fx.registry.enable("tools").await.expect("enable"),
        EnableOutcome::Ok
    );
    assert_eq!(
        fx.registry.enable("tools").await.expect("enable"),
        EnableOutcome::Ok
    );
    assert_eq!(fx.registry.enabled_names(), vec!["tools".to_owned()]);

    fx.registry.unload("tools").expect("unload");
    assert!(fx.registry.enabled_names().is_empty());
    fx.registry.enable("tools").await.expect("enable");
    assert_eq!(fx.actions.setups.load(Ordering::SeqCst), 1);

    assert!(matches!(
        fx.registry.unload("other"),
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn enable_unknown_package() {
    let mut fx = fixture();
    assert_eq!(
        fx.registry.enable("nothing").await.expect("enable"),
        EnableOutcome::NotFound
    );
}

/// A failing setup keeps the package disabled.
#[tokio::test]
async fn enable_setup_failure() {
    let mut fx = fixture_with(
        FakeActions {
            fail_setup: true,
            ..FakeActions::default()
        },
        Vec::new(),
    );
    let (archive, checksum) = source_archive(fx.root.path(), "tools", b"v1");
    fx.registry
        .install("tools", &checksum, Some(&archive))
        .await
        .expect("install");

    let outcome = fx.registry.enable("tools").await.expect("enable");
    assert!(matches!(outcome, EnableOutcome::SetupFailure(_)));
    assert!(fx.registry.enabled_names().is_empty());
}

/// Packages in global directories are found, enabled and only ever
/// unloaded.
#[tokio::test]
async fn global_packages() {
    let global = tempfile::tempdir().expect("global dir");
    fs::create_dir_all(global.path().join("shared")).expect("mkdir");
    let mut fx = fixture_with(FakeActions::default(), vec![global.path().to_path_buf()]);

    let installed = fx.registry.list_installed().expect("list");
    assert_eq!(installed.len(), 1);
    assert!(installed[0].global);

    fx.registry.enable("shared").await.expect("enable");
    assert_eq!(fx.registry.enabled_dirs(), vec![global.path().join("shared")]);

    fx.registry.disable("shared").await.expect("disable");
    assert!(fx.registry.enabled_names().is_empty());
    assert!(global.path().join("shared").is_dir());
}

// ── Disable and clear ───────────────────────────────────

/// Disabling deletes the unpacked files but keeps the archive.
#[tokio::test]
async fn disable_keeps_archive() {
    let mut fx = fixture();
    let (archive, checksum) = source_archive(fx.root.path(), "tools", b"v1");
    fx.registry
        .install("tools", &checksum, Some(&archive))
        .await
        .expect("install");
    fx.registry.enable("tools").await.expect("enable");

    fx.registry.disable("tools").await.expect("disable");
    assert!(!fx.registry.dir().join("tools").exists());
    assert!(fx.registry.archive_path("tools").is_file());
    assert!(fx.registry.enabled_names().is_empty());

    let outcome = fx
        .registry
        .install("tools", &checksum, None)
        .await
        .expect("install");
    assert_eq!(outcome, InstallOutcome::Ok { unpacked: true });
    assert_eq!(fx.actions.unpacks.load(Ordering::SeqCst), 2);
}

/// Clearing removes the archive too.
#[tokio::test]
async fn clear_removes_archive() {
    let mut fx = fixture();
    let (archive, checksum) = source_archive(fx.root.path(), "tools", b"v1");
    fx.registry
        .install("tools", &checksum, Some(&archive))
        .await
        .expect("install");

    fx.registry.clear("tools").await.expect("clear");
    assert!(!fx.registry.archive_path("tools").exists());
    assert!(matches!(
        fx.registry.clear("tools").await,
        Err(AppError::NotFound(_))
    ));
}

/// Bulk operations cover every local package.
#[tokio::test]
async fn bulk_disable_and_clear() {
    let mut fx = fixture();
    for name in ["alpha", "beta"] {
        let (archive, checksum) = source_archive(fx.root.path(), name, name.as_bytes());
        fx.registry
            .install(name, &checksum, Some(&archive))
            .await
            .expect("install");
        fx.registry.enable(name).await.expect("enable");
    }

    assert_eq!(fx.registry.disable_all().await.expect("disable all"), 2);
    assert!(fx.registry.enabled_names().is_empty());
    assert_eq!(fx.registry.list_installed().expect("list").len(), 2);

    assert_eq!(fx.registry.clear_all().await.expect("clear all"), 2);
    assert!(fx.registry.list_installed().expect("list").is_empty());
}

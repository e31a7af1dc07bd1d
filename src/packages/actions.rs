//! External package actions: unpack, build and setup.
//!
//! Packages are gzipped tar archives containing one top-level directory named
//! after the package. Optional `PKG-INF/BUILD.sh` and `PKG-INF/SETUP.sh`
//! scripts run with the package directory as working directory; their output
//! is streamed line by line into the session log.

use std::path::Path;
use std::process::Stdio;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::log_channel::LogChannel;
use crate::{AppError, Result};

/// Metadata directory inside an unpacked package.
pub const PKG_INF: &str = "PKG-INF";

/// Build script, relative to the package directory.
pub const BUILD_SCRIPT: &str = "PKG-INF/BUILD.sh";

/// Setup script, relative to the package directory.
pub const SETUP_SCRIPT: &str = "PKG-INF/SETUP.sh";

/// Operations the registry delegates to the outside world.
pub trait PackageActions: Send + Sync {
    /// Unpack `archive` into `dest_parent`, producing `dest_parent/<name>`.
    fn unpack<'a>(
        &'a self,
        archive: &'a Path,
        dest_parent: &'a Path,
        log: &'a LogChannel,
    ) -> BoxFuture<'a, Result<()>>;

    /// Run the build step of an unpacked package, if it has one.
    fn build<'a>(&'a self, dir: &'a Path, log: &'a LogChannel) -> BoxFuture<'a, Result<()>>;

    /// Run the setup step of a package being enabled, if it has one.
    fn setup<'a>(&'a self, dir: &'a Path, log: &'a LogChannel) -> BoxFuture<'a, Result<()>>;
}

/// Default actions: `tar` for unpacking, `sh` for scripts.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellPackageActions;

impl PackageActions for ShellPackageActions {
    fn unpack<'a>(
        &'a self,
        archive: &'a Path,
        dest_parent: &'a Path,
        log: &'a LogChannel,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut cmd = Command::new("tar");
            cmd.arg("-xzf").arg(archive).arg("-C").arg(dest_parent);
            run_streamed(cmd, log, "unpack").await
        })
    }

    fn build<'a>(&'a self, dir: &'a Path, log: &'a LogChannel) -> BoxFuture<'a, Result<()>> {
        Box::pin(run_script(dir, BUILD_SCRIPT, log))
    }

    fn setup<'a>(&'a self, dir: &'a Path, log: &'a LogChannel) -> BoxFuture<'a, Result<()>> {
        Box::pin(run_script(dir, SETUP_SCRIPT, log))
    }
}

async fn run_script(dir: &Path, script: &str, log: &LogChannel) -> Result<()> {
    if !dir.join(script).is_file() {
        debug!(dir = %dir.display(), script, "no script, skipping");
        return Ok(());
    }
    let mut cmd = Command::new("sh");
    cmd.arg(script).current_dir(dir);
    run_streamed(cmd, log, script).await
}

async fn run_streamed(mut cmd: Command, log: &LogChannel, what: &str) -> Result<()> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Package(format!("{what}: cannot start: {err}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Package(format!("{what}: stdout not captured")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Package(format!("{what}: stderr not captured")))?;

    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_open = true;
    let mut err_open = true;
    while out_open || err_open {
        tokio::select! {
            line = out_lines.next_line(), if out_open => match line {
                Ok(Some(line)) => log.append_line(&line)?,
                _ => out_open = false,
            },
            line = err_lines.next_line(), if err_open => match line {
                Ok(Some(line)) => log.append_line(&line)?,
                _ => err_open = false,
            },
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|err| AppError::Package(format!("{what}: cannot wait: {err}")))?;
    if status.success() {
        Ok(())
    } else {
        warn!(what, %status, "package action failed");
        Err(AppError::Package(format!("{what} failed with {status}")))
    }
}

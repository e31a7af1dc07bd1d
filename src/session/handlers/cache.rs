//! Cache and package management.
//!
//! The action runs locally first; on success it is repeated on every active
//! subordinate so a package is consistent tree-wide before the requester is
//! told it is available.

use std::fmt::Write as _;

use futures_util::future::BoxFuture;

use crate::cache::CacheAdd;
use crate::packages::{EnableOutcome, InstallOutcome, PackageRecord};
use crate::protocol::messages::CacheRequest;
use crate::protocol::{Reply, Request};
use crate::session::coordinator::SessionCoordinator;
use crate::{AppError, Result};

pub(super) fn cache(node: &mut SessionCoordinator, request: Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let action: CacheRequest = request.payload()?;
        apply(node, &action).await?;
        if action.fans_out() {
            node.fan_out(&request).await.into_result()?;
        }
        Ok(())
    })
}

async fn apply(node: &mut SessionCoordinator, action: &CacheRequest) -> Result<()> {
    match action {
        CacheRequest::ShowCache => {
            let entries = node.cache.list().await?;
            if entries.is_empty() {
                node.note("Cache is empty");
            }
            for entry in entries {
                node.note(&format!("{:>12}  {}", entry.size, entry.name));
            }
        }
        CacheRequest::ClearCache => {
            let removed = node.cache.clear().await?;
            node.note(&format!("Removed {removed} cache entries"));
        }
        CacheRequest::AddToCache { path } => {
            match node.cache.add(path).await? {
                CacheAdd::Copied(target) => node.note(&format!("Cached {}", target.display())),
                CacheAdd::Unchanged(target) => {
                    node.note(&format!("{} is already cached", target.display()));
                }
            }
        }
        CacheRequest::ShowPackages => {
            let packages = node.packages.list_installed()?;
            node.note(&describe_packages("Available packages", &packages));
        }
        CacheRequest::ListPackages => {
            let packages = node.packages.list_installed()?;
            node.send(Reply::Packages { packages }).await;
        }
        CacheRequest::ShowEnabledPackages => {
            let packages = node.packages.list_enabled();
            node.note(&describe_packages("Enabled packages", &packages));
        }
        CacheRequest::ListEnabledPackages => {
            let packages = node.packages.list_enabled();
            node.send(Reply::Packages { packages }).await;
        }
        CacheRequest::InstallPackage {
            name,
            checksum,
            archive,
        } => match node.packages.install(name, checksum, archive.as_deref()).await? {
            InstallOutcome::Ok { unpacked: true } => node.note(&format!("Package {name} installed")),
            InstallOutcome::Ok { unpacked: false } => {
                node.note(&format!("Package {name} already installed"));
            }
            InstallOutcome::ChecksumMismatch { expected, actual } => {
                return Err(AppError::Package(format!(
                    "checksum mismatch for {name}: expected {expected}, found {actual}"
                )));
            }
            InstallOutcome::UnpackFailure(reason) => {
                return Err(AppError::Package(format!("cannot install {name}: {reason}")));
            }
        },
        CacheRequest::EnablePackage { name } => match node.packages.enable(name).await? {
            EnableOutcome::Ok => node.note(&format!("Package {name} enabled")),
            EnableOutcome::NotFound => return Err(AppError::NotFound(format!("package {name}"))),
            EnableOutcome::SetupFailure(reason) => {
                return Err(AppError::Package(format!("setup of {name} failed: {reason}")));
            }
        },
        CacheRequest::UnloadPackage { name } => {
            node.packages.unload(name)?;
            node.note(&format!("Package {name} unloaded"));
        }
        CacheRequest::UnloadPackages => {
            let unloaded = node.packages.unload_all();
            node.note(&format!("Unloaded {unloaded} packages"));
        }
        CacheRequest::DisablePackage { name } => {
            node.packages.disable(name).await?;
            node.note(&format!("Package {name} disabled"));
        }
        CacheRequest::DisablePackages => {
            let disabled = node.packages.disable_all().await?;
            node.note(&format!("Disabled {disabled} packages"));
        }
        CacheRequest::ClearPackage { name } => {
            node.packages.clear(name).await?;
            node.note(&format!("Package {name} cleared"));
        }
        CacheRequest::ClearPackages => {
            let removed = node.packages.clear_all().await?;
            node.note(&format!("Removed {removed} entries from the package area"));
        }
    }
    Ok(())
}

fn describe_packages(title: &str, packages: &[PackageRecord]) -> String {
    if packages.is_empty() {
        return format!("{title}: none");
    }
    let mut text = format!("{title}:");
    for package in packages {
        let _ = write!(
            text,
            "\n  {}{}{}",
            package.name,
            if package.enabled { " (enabled)" } else { "" },
            if package.global { " [global]" } else { "" },
        );
    }
    text
}

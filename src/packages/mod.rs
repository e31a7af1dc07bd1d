//! Package installation and enablement.

pub mod actions;
pub mod registry;

pub use actions::{PackageActions, ShellPackageActions};
pub use registry::{EnableOutcome, InstallOutcome, PackageRecord, PackageRegistry};

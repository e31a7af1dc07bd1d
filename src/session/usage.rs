//! Process resource usage snapshots.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource usage at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// User plus system CPU seconds consumed by this process.
    pub cpu_secs: f64,
    /// CPU seconds consumed by reaped child processes, such as the query
    /// executor command.
    #[serde(default)]
    pub child_cpu_secs: f64,
    /// Bytes read by executed queries so far.
    pub bytes_read: u64,
}

impl ResourceUsage {
    /// Capture the CPU time of this process and its children together with
    /// `bytes_read`.
    #[must_use]
    pub fn snapshot(bytes_read: u64) -> Self {
        Self {
            cpu_secs: cpu_time().as_secs_f64(),
            child_cpu_secs: child_cpu_time().as_secs_f64(),
            bytes_read,
        }
    }

    /// Total CPU seconds of this process and its children.
    #[must_use]
    pub fn total_cpu_secs(&self) -> f64 {
        self.cpu_secs + self.child_cpu_secs
    }

    /// Usage accumulated between `earlier` and `self`.
    #[must_use]
    pub fn since(&self, earlier: &Self) -> Self {
        Self {
            cpu_secs: (self.cpu_secs - earlier.cpu_secs).max(0.0),
            child_cpu_secs: (self.child_cpu_secs - earlier.child_cpu_secs).max(0.0),
            bytes_read: self.bytes_read.saturating_sub(earlier.bytes_read),
        }
    }
}

/// CPU time consumed by this process.
#[cfg(unix)]
#[must_use]
pub fn cpu_time() -> Duration {
    rusage_cpu(nix::sys::resource::UsageWho::RUSAGE_SELF)
}

/// CPU time consumed by terminated and waited-for child processes.
#[cfg(unix)]
#[must_use]
pub fn child_cpu_time() -> Duration {
    rusage_cpu(nix::sys::resource::UsageWho::RUSAGE_CHILDREN)
}

#[cfg(unix)]
fn rusage_cpu(who: nix::sys::resource::UsageWho) -> Duration {
    nix::sys::resource::getrusage(who).map_or(Duration::ZERO, |usage| {
        timeval_to_duration(usage.user_time()) + timeval_to_duration(usage.system_time())
    })
}

/// CPU time consumed by this process.
#[cfg(not(unix))]
#[must_use]
pub fn cpu_time() -> Duration {
    Duration::ZERO
}

/// CPU time consumed by terminated and waited-for child processes.
#[cfg(not(unix))]
#[must_use]
pub fn child_cpu_time() -> Duration {
    Duration::ZERO
}

#[cfg(unix)]
fn timeval_to_duration(tv: nix::sys::time::TimeVal) -> Duration {
    let secs = u64::try_from(tv.tv_sec()).unwrap_or_default();
    let micros = u64::try_from(tv.tv_usec()).unwrap_or_default();
    Duration::from_secs(secs) + Duration::from_micros(micros)
}

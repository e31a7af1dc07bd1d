//! Runtime control of the tracing filter.
//!
//! The binary installs its `EnvFilter` behind a [`reload`] layer and hands
//! the handle to the session, so a requester can raise or lower verbosity
//! without restarting the process.

use std::sync::{Arc, Mutex};

use tracing_subscriber::{reload, EnvFilter};

use crate::{AppError, Result};

type ApplyFilter = dyn Fn(EnvFilter) -> Result<()> + Send + Sync;

/// Swaps the active log filter.
#[derive(Clone)]
pub struct LogLevelControl {
    apply: Arc<ApplyFilter>,
    current: Arc<Mutex<String>>,
}

impl std::fmt::Debug for LogLevelControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogLevelControl")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}

impl LogLevelControl {
    /// Control the filter behind a reload `handle`, currently `initial`.
    #[must_use]
    pub fn from_handle<S: 'static>(handle: reload::Handle<EnvFilter, S>, initial: &str) -> Self {
        let apply = move |filter: EnvFilter| {
            handle
                .reload(filter)
                .map_err(|err| AppError::Config(format!("cannot change log level: {err}")))
        };
        Self {
            apply: Arc::new(apply),
            current: Arc::new(Mutex::new(initial.to_owned())),
        }
    }

    /// A control that records the requested filter without a subscriber
    /// behind it.
    #[must_use]
    pub fn detached(initial: &str) -> Self {
        Self {
            apply: Arc::new(|_| Ok(())),
            current: Arc::new(Mutex::new(initial.to_owned())),
        }
    }

    /// Replace the filter with `directives` (`EnvFilter` syntax, e.g.
    /// `debug` or `info,session_node::lock=trace`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the directives do not parse or the
    /// subscriber is gone.
    pub fn set(&self, directives: &str) -> Result<()> {
        let directives = directives.trim();
        if directives.is_empty() {
            return Err(AppError::Config("empty log filter".into()));
        }
        let filter = EnvFilter::try_new(directives)
            .map_err(|err| AppError::Config(format!("invalid log filter '{directives}': {err}")))?;
        (self.apply)(filter)?;
        if let Ok(mut current) = self.current.lock() {
            directives.clone_into(&mut *current);
        }
        Ok(())
    }

    /// The filter last applied.
    #[must_use]
    pub fn current(&self) -> String {
        self.current
            .lock()
            .map(|current| current.clone())
            .unwrap_or_default()
    }
}

//! Session identity and lifecycle state.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::is_valid_ordinal;
use crate::{AppError, Result};

/// Role a session plays in the fan-out tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Top of the tree; talks to the client.
    #[default]
    Coordinator,
    /// Worker or sub-master below a coordinator.
    Subordinate,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Opening resources, before the first message is handled.
    Initializing,
    /// Waiting for work.
    Idle,
    /// Draining the waiting queue.
    Processing,
    /// Shutting down; no further messages are handled.
    Terminating,
}

impl SessionState {
    /// Whether a transition from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initializing | Self::Processing, Self::Idle)
                | (Self::Idle, Self::Processing)
                | (
                    Self::Initializing | Self::Idle | Self::Processing,
                    Self::Terminating
                )
        )
    }
}

fn tag_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[0-9]+(\.[0-9]+)*-[A-Za-z0-9_](?:[A-Za-z0-9_.-]*[A-Za-z0-9_])?-[0-9]+-[0-9]+$").ok())
        .as_ref()
}

/// Unique session identifier: `<ordinal>-<host>-<unixSeconds>-<pid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionTag(String);

impl SessionTag {
    /// Build the tag for the current process.
    #[must_use]
    pub fn generate(ordinal: &str) -> Self {
        Self::from_parts(
            ordinal,
            &short_host_name(),
            Utc::now().timestamp(),
            std::process::id(),
        )
    }

    /// Build a tag from explicit parts.
    #[must_use]
    pub fn from_parts(ordinal: &str, host: &str, unix_secs: i64, pid: u32) -> Self {
        Self(format!("{ordinal}-{host}-{unix_secs}-{pid}"))
    }

    /// Parse a bare tag or a `session-<tag>` directory name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Query` if the text does not look like a tag.
    pub fn parse(raw: &str) -> Result<Self> {
        let bare = raw.strip_prefix("session-").unwrap_or(raw);
        if tag_pattern().is_some_and(|re| re.is_match(bare)) {
            Ok(Self(bare.to_owned()))
        } else {
            Err(AppError::Query(format!("malformed session tag '{raw}'")))
        }
    }

    /// The tag text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the session's query-results directory.
    #[must_use]
    pub fn dir_name(&self) -> String {
        format!("session-{}", self.0)
    }

    /// Ordinal component of the tag.
    #[must_use]
    pub fn ordinal(&self) -> &str {
        self.0.split('-').next().unwrap_or_default()
    }

    /// Process id component of the tag.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.0.rsplit('-').next().and_then(|pid| pid.parse().ok())
    }
}

impl TryFrom<String> for SessionTag {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SessionTag> for String {
    fn from(tag: SessionTag) -> Self {
        tag.0
    }
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(unix)]
fn short_host_name() -> String {
    let full = nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".into());
    short_name(&full)
}

#[cfg(not(unix))]
fn short_host_name() -> String {
    let full = std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".into());
    short_name(&full)
}

fn short_name(full: &str) -> String {
    let cleaned: String = full
        .split('.')
        .next()
        .unwrap_or(full)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let short = cleaned.trim_matches('-');
    if short.is_empty() {
        "localhost".into()
    } else {
        short.to_owned()
    }
}

/// One long-lived session process.
#[derive(Debug, Clone)]
pub struct Session {
    role: Role,
    ordinal: String,
    tag: SessionTag,
    state: SessionState,
    protocol: u32,
    protocol_negotiated: bool,
    work_dir: PathBuf,
    started_at: DateTime<Utc>,
}

impl Session {
    /// Create a session in the `Initializing` state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the ordinal is malformed.
    pub fn new(role: Role, ordinal: &str, protocol: u32, work_dir: PathBuf) -> Result<Self> {
        if !is_valid_ordinal(ordinal) {
            return Err(AppError::Config(format!("malformed ordinal '{ordinal}'")));
        }
        Ok(Self {
            role,
            ordinal: ordinal.to_owned(),
            tag: SessionTag::generate(ordinal),
            state: SessionState::Initializing,
            protocol,
            protocol_negotiated: false,
            work_dir,
            started_at: Utc::now(),
        })
    }

    /// Role in the fan-out tree.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Ordinal path.
    #[must_use]
    pub fn ordinal(&self) -> &str {
        &self.ordinal
    }

    /// Unique tag.
    #[must_use]
    pub fn tag(&self) -> &SessionTag {
        &self.tag
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated protocol revision.
    #[must_use]
    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    /// Shared work directory.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// When the session started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether this session is the top coordinator.
    #[must_use]
    pub fn is_coordinator(&self) -> bool {
        self.role == Role::Coordinator
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` for an illegal transition.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(AppError::Protocol(format!(
                "illegal session transition {:?} -> {next:?}",
                self.state
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Settle the protocol revision with the peer's offer.
    ///
    /// Negotiation happens once per session; the agreed revision is the
    /// lower of both offers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the protocol was already negotiated
    /// or the offer is zero.
    pub fn negotiate_protocol(&mut self, offered: u32) -> Result<u32> {
        if self.protocol_negotiated {
            return Err(AppError::Protocol(
                "protocol already negotiated for this session".into(),
            ));
        }
        if offered == 0 {
            return Err(AppError::Protocol("protocol revision 0 is invalid".into()));
        }
        self.protocol = self.protocol.min(offered);
        self.protocol_negotiated = true;
        Ok(self.protocol)
    }
}

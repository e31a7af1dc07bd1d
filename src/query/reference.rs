//! Parsing of query references.
//!
//! Accepted forms:
//! - `7`: query 7 of the current session;
//! - `<tag>:7`: query 7 of session `<tag>`;
//! - `session-<tag>:q7`: the form used by query listings of older clients.

use std::fmt;
use std::str::FromStr;

use crate::session::model::SessionTag;
use crate::{AppError, Result};

/// A reference to one query record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryRef {
    /// Sequence number in the current session.
    Local(u64),
    /// Sequence number in a named session.
    Qualified {
        /// Owning session.
        tag: SessionTag,
        /// Sequence number.
        seq: u64,
    },
}

impl QueryRef {
    /// The sequence number.
    #[must_use]
    pub fn seq(&self) -> u64 {
        match self {
            Self::Local(seq) | Self::Qualified { seq, .. } => *seq,
        }
    }

    /// The session the reference points into, given the current session.
    #[must_use]
    pub fn owner<'a>(&'a self, current: &'a SessionTag) -> &'a SessionTag {
        match self {
            Self::Local(_) => current,
            Self::Qualified { tag, .. } => tag,
        }
    }

    /// Whether the reference resolves into the current session.
    #[must_use]
    pub fn is_local_to(&self, current: &SessionTag) -> bool {
        self.owner(current) == current
    }
}

impl FromStr for QueryRef {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Ok(seq) = raw.parse::<u64>() {
            return Ok(Self::Local(seq));
        }
        let Some((tag, seq)) = raw.rsplit_once(':') else {
            return Err(AppError::Query(format!("invalid query reference '{raw}'")));
        };
        let seq = seq
            .strip_prefix('q')
            .unwrap_or(seq)
            .parse::<u64>()
            .map_err(|_| AppError::Query(format!("invalid sequence number in '{raw}'")))?;
        let tag = SessionTag::parse(tag)?;
        Ok(Self::Qualified { tag, seq })
    }
}

impl fmt::Display for QueryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(seq) => write!(f, "{seq}"),
            Self::Qualified { tag, seq } => write!(f, "{tag}:{seq}"),
        }
    }
}

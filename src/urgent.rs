//! Out-of-band interrupts.
//!
//! Interrupts travel as single bytes on a side channel, outside the ordered
//! control stream, so they reach a session even while it is busy executing a
//! query.

use serde::{Deserialize, Serialize};

/// Out-of-band interrupt kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interrupt {
    /// Abort the running query and discard queued control messages.
    Hard,
    /// Stop the running query, keeping partial results.
    Soft,
    /// Terminate the session.
    Shutdown,
}

impl Interrupt {
    /// Decode a wire byte; unknown values yield `None`.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Hard),
            2 => Some(Self::Soft),
            3 => Some(Self::Shutdown),
            _ => None,
        }
    }

    /// Wire byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Hard => 1,
            Self::Soft => 2,
            Self::Shutdown => 3,
        }
    }
}

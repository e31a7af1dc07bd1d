//! Local-socket plumbing between a session and its requester, and between a
//! session and its subordinates.
//!
//! The coordinator itself never touches a socket: it talks to
//! [`SessionChannels`], and the tasks in this module move frames between
//! those channels and the connection.

pub mod client;
pub mod server;
pub mod wire;

use tokio::sync::mpsc;

use crate::protocol::{Reply, Request};
use crate::session::{SessionChannels, SubordinateLink};
use crate::urgent::Interrupt;

/// Capacity of the control and reply channels.
pub const CHANNEL_CAPACITY: usize = 64;

/// The requester's ends of a session's channels.
#[derive(Debug)]
pub struct PeerChannels {
    /// Requests to the session.
    pub requests: mpsc::Sender<Request>,
    /// Replies from the session.
    pub replies: mpsc::Receiver<Reply>,
    /// Interrupts to the session.
    pub urgent: mpsc::Sender<Interrupt>,
}

impl PeerChannels {
    /// Use these channels as the link to subordinate `ordinal`.
    #[must_use]
    pub fn into_link(self, ordinal: impl Into<String>) -> SubordinateLink {
        SubordinateLink::new(ordinal, self.requests, self.replies, self.urgent)
    }
}

/// Create connected session and requester channel ends.
#[must_use]
pub fn channel_pair(capacity: usize) -> (SessionChannels, PeerChannels) {
    let (request_tx, request_rx) = mpsc::channel(capacity);
    let (reply_tx, reply_rx) = mpsc::channel(capacity);
    let (urgent_tx, urgent_rx) = mpsc::channel(8);
    (
        SessionChannels {
            inbound: request_rx,
            outbound: reply_tx,
            urgent: urgent_rx,
        },
        PeerChannels {
            requests: request_tx,
            replies: reply_rx,
            urgent: urgent_tx,
        },
    )
}

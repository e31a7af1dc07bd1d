//! Control-connection message types and framing.

pub mod codec;
pub mod messages;

pub use codec::{NodeCodec, MAX_LINE_BYTES};
pub use messages::{OpCode, Reply, Request};

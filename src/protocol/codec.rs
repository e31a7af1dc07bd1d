//! NDJSON codec for control connections.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! peer that never sends a newline cannot make the node buffer without
//! bound. Use [`NodeCodec`] with [`tokio_util::codec::FramedRead`] and
//! [`tokio_util::codec::FramedWrite`] in both directions.

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum accepted line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited UTF-8 framing with a [`MAX_LINE_BYTES`] limit.
#[derive(Debug)]
pub struct NodeCodec(LinesCodec);

impl NodeCodec {
    /// Codec with the default limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for NodeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NodeCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for NodeCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

/// Serialize one message as a single JSON line (without the newline).
///
/// # Errors
///
/// Returns `AppError::Protocol` if the value cannot be encoded.
pub fn to_line<T: Serialize>(message: &T) -> Result<String> {
    serde_json::to_string(message).map_err(Into::into)
}

/// Parse one JSON line.
///
/// # Errors
///
/// Returns `AppError::Protocol` if the line is not a valid message.
pub fn from_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim()).map_err(Into::into)
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Protocol(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}

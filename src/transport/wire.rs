//! Reader and writer tasks moving NDJSON messages between a byte stream and
//! a channel. Used in both directions: a session reads requests and writes
//! replies, a parent reads replies and writes requests.

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::codec::{from_line, to_line};
use crate::protocol::NodeCodec;
use crate::{AppError, Result};

/// Decode lines from `input` and forward them to `tx`.
///
/// Malformed lines are logged and skipped. An over-long line is logged and
/// ends the stream like EOF does. Returns on EOF, on an I/O error, on
/// cancellation, or when `tx` is closed; dropping `tx` then tells the
/// consumer that the peer is gone.
///
/// # Errors
///
/// Never fails today; the `Result` mirrors [`run_writer`].
pub async fn run_reader<R, T>(
    peer: String,
    input: R,
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    T: DeserializeOwned + Send,
{
    let mut framed = FramedRead::new(input, NodeCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(peer, "reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(peer, "reader: EOF");
                        break;
                    }
                    Some(Err(AppError::Protocol(ref msg))) => {
                        warn!(peer, error = msg.as_str(), "reader: framing error");
                    }
                    Some(Err(err)) => {
                        warn!(peer, %err, "reader: I/O error, stopping");
                        break;
                    }
                    Some(Ok(line)) if line.trim().is_empty() => {}
                    Some(Ok(line)) => match from_line::<T>(&line) {
                        Ok(message) => {
                            if tx.send(message).await.is_err() {
                                debug!(peer, "reader: channel closed, stopping");
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(peer, %err, raw_line = %line, "reader: malformed message, skipping");
                        }
                    },
                }
            }
        }
    }

    Ok(())
}

/// Serialize messages from `rx` and write them to `output`, one per line.
///
/// Returns when `rx` is closed or on cancellation.
///
/// # Errors
///
/// Returns `AppError::Transport` if a write fails.
pub async fn run_writer<W, T>(
    peer: String,
    output: W,
    mut rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize + Send,
{
    let mut output = output;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(peer, "writer: cancellation received, stopping");
                break;
            }

            message = rx.recv() => {
                let Some(message) = message else {
                    debug!(peer, "writer: channel closed, stopping");
                    break;
                };
                let mut line = match to_line(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(peer, %err, "writer: cannot encode message, dropping");
                        continue;
                    }
                };
                line.push('\n');
                output.write_all(line.as_bytes()).await.map_err(|e| {
                    warn!(peer, error = %e, "writer: write failed");
                    AppError::Transport(format!("write to {peer} failed: {e}"))
                })?;
            }
        }
    }

    output.flush().await.ok();
    Ok(())
}

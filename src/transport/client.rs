//! Connections from a session to its subordinates.

use interprocess::local_socket::tokio::{prelude::*, Stream};
use interprocess::local_socket::GenericNamespaced;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::wire::{run_reader, run_writer};
use super::CHANNEL_CAPACITY;
use crate::config::SubordinateConfig;
use crate::session::SubordinateLink;
use crate::urgent::Interrupt;
use crate::{AppError, Result};

async fn connect(name: &str) -> Result<Stream> {
    let ns_name = name
        .to_owned()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Transport(format!("invalid ipc socket name '{name}': {err}")))?;
    Stream::connect(ns_name)
        .await
        .map_err(|err| AppError::Transport(format!("cannot connect to '{name}': {err}")))
}

/// Connect to a subordinate's control socket and spawn the tasks serving
/// the link.
///
/// Interrupts are delivered on short-lived connections to the
/// subordinate's urgent socket, `<ipc_name>-urgent`.
///
/// # Errors
///
/// Returns `AppError::Transport` if the control socket cannot be reached.
pub async fn connect_subordinate(
    subordinate: &SubordinateConfig,
    ct: CancellationToken,
) -> Result<SubordinateLink> {
    let stream = connect(&subordinate.ipc_name).await?;
    info!(ordinal = %subordinate.ordinal, ipc_name = %subordinate.ipc_name, "subordinate connected");
    let (reader, writer) = stream.split();

    let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (reply_tx, reply_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (urgent_tx, urgent_rx) = mpsc::channel(8);

    let peer = format!("subordinate {}", subordinate.ordinal);
    tokio::spawn(run_writer(peer.clone(), writer, request_rx, ct.clone()));
    tokio::spawn(run_reader(peer, reader, reply_tx, ct.clone()));
    tokio::spawn(forward_interrupts(
        format!("{}-urgent", subordinate.ipc_name),
        urgent_rx,
        ct,
    ));

    Ok(SubordinateLink::new(
        subordinate.ordinal.clone(),
        request_tx,
        reply_rx,
        urgent_tx,
    ))
}

async fn forward_interrupts(name: String, mut rx: mpsc::Receiver<Interrupt>, ct: CancellationToken) {
    loop {
        let interrupt = tokio::select! {
            () = ct.cancelled() => break,
            interrupt = rx.recv() => match interrupt {
                Some(interrupt) => interrupt,
                None => break,
            },
        };
        if let Err(err) = send_interrupt(&name, interrupt).await {
            warn!(%err, ?interrupt, "cannot deliver interrupt");
        }
    }
}

/// Deliver one interrupt byte to the urgent socket `name`.
///
/// # Errors
///
/// Returns `AppError::Transport` if the socket cannot be reached or written.
pub async fn send_interrupt(name: &str, interrupt: Interrupt) -> Result<()> {
    let mut stream = connect(name).await?;
    stream
        .write_all(&[interrupt.to_byte()])
        .await
        .map_err(|err| AppError::Transport(format!("cannot write interrupt to '{name}': {err}")))
}

//! Local socket listeners of a session.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. The control socket accepts exactly one
//! connection for the lifetime of the session; later connections are
//! refused. The urgent socket accepts any number of short connections, each
//! carrying interrupt bytes.

use interprocess::local_socket::tokio::Listener;
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::wire::{run_reader, run_writer};
use super::PeerChannels;
use crate::protocol::{Reply, Request};
use crate::urgent::Interrupt;
use crate::{AppError, Result};

fn bind(name: &str) -> Result<Listener> {
    let listener_name = name
        .to_owned()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Transport(format!("invalid ipc socket name '{name}': {err}")))?;

    ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Transport(format!("failed to create ipc listener '{name}': {err}")))
}

/// Spawn the control and urgent listeners feeding `peer`.
///
/// # Errors
///
/// Returns `AppError::Transport` if a listener cannot be created.
pub fn spawn_session_server(
    control_name: &str,
    urgent_name: &str,
    peer: PeerChannels,
    ct: CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let control = bind(control_name)?;
    let urgent = bind(urgent_name)?;
    info!(control = control_name, urgent = urgent_name, "session listening");

    let PeerChannels {
        requests,
        replies,
        urgent: urgent_tx,
    } = peer;

    let control_task = {
        let span = info_span!("control_server", name = %control_name);
        tokio::spawn(serve_control(control, requests, replies, ct.clone()).instrument(span))
    };
    let urgent_task = {
        let span = info_span!("urgent_server", name = %urgent_name);
        tokio::spawn(serve_urgent(urgent, urgent_tx, ct).instrument(span))
    };
    Ok(vec![control_task, urgent_task])
}

async fn serve_control(
    listener: Listener,
    requests: mpsc::Sender<Request>,
    replies: mpsc::Receiver<Reply>,
    ct: CancellationToken,
) {
    let mut pending = Some((requests, replies));
    loop {
        tokio::select! {
            () = ct.cancelled() => {
                info!("control server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok(stream) => {
                        if let Some((requests, replies)) = pending.take() {
                            tokio::spawn(handle_connection(stream, requests, replies, ct.clone()));
                        } else {
                            warn!("control connection already established; refusing another");
                        }
                    }
                    Err(err) => warn!(%err, "control accept failed"),
                }
            }
        }
    }
}

/// Bridge the single control connection to the coordinator's channels.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    requests: mpsc::Sender<Request>,
    replies: mpsc::Receiver<Reply>,
    ct: CancellationToken,
) {
    let span = info_span!("control_conn");
    async move {
        info!("control connection established");
        let (reader, writer) = stream.split();
        let writer_task = tokio::spawn(run_writer("requester".into(), writer, replies, ct.clone()));
        if let Err(err) = run_reader("requester".into(), reader, requests, ct).await {
            warn!(%err, "control reader failed");
        }
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%err, "control writer failed"),
            Err(err) => warn!(%err, "control writer task panicked"),
        }
        info!("control connection closed");
    }
    .instrument(span)
    .await;
}

async fn serve_urgent(listener: Listener, urgent: mpsc::Sender<Interrupt>, ct: CancellationToken) {
    loop {
        tokio::select! {
            () = ct.cancelled() => break,
            accept_result = listener.accept() => {
                match accept_result {
                    Ok(stream) => {
                        tokio::spawn(read_interrupts(stream, urgent.clone(), ct.clone()));
                    }
                    Err(err) => warn!(%err, "urgent accept failed"),
                }
            }
        }
    }
}

async fn read_interrupts(
    stream: interprocess::local_socket::tokio::Stream,
    urgent: mpsc::Sender<Interrupt>,
    ct: CancellationToken,
) {
    let (mut reader, _writer) = stream.split();
    let mut buf = [0_u8; 16];
    loop {
        let read = tokio::select! {
            () = ct.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                for &byte in &buf[..n] {
                    match Interrupt::from_byte(byte) {
                        Some(interrupt) => {
                            if urgent.send(interrupt).await.is_err() {
                                return;
                            }
                        }
                        None => warn!(byte, "ignoring unknown interrupt byte"),
                    }
                }
            }
            Err(err) => {
                debug!(%err, "urgent connection read failed");
                break;
            }
        }
    }
}

//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to
//! it through a cloneable [`HandleController`] that sends commands over an
//! mpsc channel, so the handle is never shared behind a lock.
//!
//! The task ends when a `Disconnect` arrives, when every controller is
//! dropped, or when the server closes the connection. In all three cases the
//! controller's `closed` token fires and queued commands are answered with
//! `Disconnect`.

use std::time::Duration;

use russh::client::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner task polls the handle for a server-side close
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Request remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel remote forward
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    closed: CancellationToken,
}

impl HandleController {
    /// Wrap an existing command channel. In production use
    /// [`spawn_handle_owner_task`].
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>, closed: CancellationToken) -> Self {
        Self { cmd_tx, closed }
    }

    /// Request remote port forward.
    ///
    /// Returns the actual bound port (differs from `port` when it was 0).
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ForwardFailed(e.to_string()))
    }

    /// Cancel a remote port forward
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ForwardFailed(e.to_string()))
    }

    /// Ask the owner task to disconnect. Does not wait.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.cmd_tx.is_closed()
    }

    /// Resolves once the owner task has finished.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for
/// sending commands. `label` only appears in logs.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(16);
    let closed = CancellationToken::new();
    let closed_signal = closed.clone();

    tokio::spawn(async move {
        let mut handle = handle; // sole owner
        let mut poll = tokio::time::interval(CLOSE_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!("Handle owner task started for {}", label);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::TcpipForward { address, port, reply_tx }) => {
                        let result = handle.tcpip_forward(&address, port).await;
                        match &result {
                            Ok(bound_port) => {
                                let bound_port = *bound_port;
                                if reply_tx.send(result).is_err() {
                                    // Caller is gone but the server is listening; undo it
                                    warn!(
                                        "Caller dropped after tcpip_forward succeeded. \
                                         Cancelling orphaned forward {}:{}",
                                        address, bound_port
                                    );
                                    let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                                }
                            }
                            Err(_) => {
                                let _ = reply_tx.send(result);
                            }
                        }
                    }
                    Some(HandleCommand::CancelTcpipForward { address, port, reply_tx }) => {
                        let result = handle.cancel_tcpip_forward(&address, port).await;
                        let _ = reply_tx.send(result);
                    }
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for {}", label);
                        break;
                    }
                    None => {
                        debug!("All controllers dropped for {}", label);
                        break;
                    }
                },
                _ = poll.tick() => {
                    if handle.is_closed() {
                        warn!("SSH connection to {} closed by peer", label);
                        break;
                    }
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Server closing", "en")
            .await;
        closed_signal.cancel();
        debug!("Handle owner task terminated for {}", label);
    });

    HandleController { cmd_tx, closed }
}

/// Answer every queued command with `Disconnect`.
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}

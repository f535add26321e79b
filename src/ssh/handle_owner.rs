//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to it
//! through a cloneable `HandleController` that sends commands over an mpsc
//! channel and receives replies over oneshot channels.
//!
//! Console captures, command injection and health probes all share one
//! transport this way without ever holding a lock across `.await`.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Upper bound on a keepalive round trip
const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply in time; the link may just be slow
    Timeout,
    /// Transport is gone
    IoError,
}

impl PingResult {
    pub fn is_ok(self) -> bool {
        self == PingResult::Ok
    }
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (one per remote command)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// keepalive@openssh.com with want-reply
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (one `mpsc::Sender`). Any holder has full control of the
/// transport, so controllers never leave the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Wrap an existing sender. Used by tests to stand in for a live handle.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::Channel(e.to_string()))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Keepalive probe
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Whether the owner task is still running
    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the Handle and returns the controller. `label` only appears in logs.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let handle = handle;

        debug!("Handle owner task started for {}", label);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        // Dropped channel gets closed by the server
                        warn!("Caller dropped before receiving channel for {}", label);
                    }
                }

                HandleCommand::Ping { reply_tx } => {
                    let result =
                        match tokio::time::timeout(PING_TIMEOUT, handle.send_keepalive(true)).await
                        {
                            Ok(Ok(())) => PingResult::Ok,
                            Ok(Err(e)) => {
                                warn!("Keepalive failed for {}: {:?}", label, e);
                                PingResult::IoError
                            }
                            Err(_) => {
                                warn!("Keepalive timeout for {} ({}s)", label, PING_TIMEOUT.as_secs());
                                PingResult::Timeout
                            }
                        };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    debug!("Disconnect requested for {}", label);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("SSH connection to {} closed", label);
    });

    HandleController { cmd_tx }
}

/// Fail every queued command with Disconnected
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_after_owner_gone() {
        let (tx, rx) = mpsc::channel(1);
        let controller = HandleController::new(tx);
        drop(rx);

        assert!(!controller.is_alive());
        assert_eq!(controller.ping().await, PingResult::IoError);
        assert!(matches!(
            controller.open_session_channel().await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_ping_reply_forwarded() {
        let (tx, mut rx) = mpsc::channel(1);
        let controller = HandleController::new(tx);

        tokio::spawn(async move {
            if let Some(HandleCommand::Ping { reply_tx }) = rx.recv().await {
                let _ = reply_tx.send(PingResult::Timeout);
            }
        });

        assert_eq!(controller.ping().await, PingResult::Timeout);
        assert!(!PingResult::Timeout.is_ok());
    }

    #[tokio::test]
    async fn test_drain_replies_disconnected() {
        let (tx, mut rx) = mpsc::channel(4);
        let (ping_tx, ping_rx) = oneshot::channel();
        tx.send(HandleCommand::Ping { reply_tx: ping_tx }).await.unwrap();
        tx.send(HandleCommand::Disconnect).await.unwrap();

        drain_pending_commands(&mut rx);
        assert_eq!(ping_rx.await.unwrap(), PingResult::IoError);
        assert!(tx.is_closed());
    }
}

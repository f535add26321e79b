//! SSH Client implementation using russh

use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::*;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::known_hosts::HostKeyPolicy;

/// Terminal type requested for PTY-backed commands
const PTY_TERM: &str = "xterm-256color";

/// Echo off, 14400 baud in both directions
const PTY_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 0),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// Bound for `test_connection`
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SshClient {
    config: SshConfig,
    policy: HostKeyPolicy,
}

impl SshClient {
    /// Client using the host key policy described by the config
    pub fn new(config: SshConfig) -> Self {
        let policy = HostKeyPolicy::from_config(&config);
        Self { config, policy }
    }

    pub fn with_policy(config: SshConfig, policy: HostKeyPolicy) -> Self {
        Self { config, policy }
    }

    /// Dial, verify the host key, authenticate, and hand the handle to its owner task
    pub async fn connect(self) -> Result<SshConnection, SshError> {
        let addr = self.config.address();

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::Network(format!("Failed to resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| SshError::Network(format!("No address found for {}", addr)))?;

        let ssh_config = client::Config {
            inactivity_timeout: None, // liveness is owned by the pool's health loop
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(self.config.host.clone(), self.config.port, self.policy);

        let mut handle = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Network(format!("Connection to {} timed out", addr)))?
        .map_err(|e| match e {
            SshError::HostKeyMismatch(_) | SshError::Network(_) => e,
            other => SshError::Network(other.to_string()),
        })?;

        debug!("SSH handshake completed with {}", addr);

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| SshError::Authentication(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| SshError::Key(format!("{}: {}", key_path, e)))?;

                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::Authentication(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::Authentication(format!(
                "{}@{} rejected by server",
                self.config.username, addr
            )));
        }

        info!("SSH authentication successful for {}@{}", self.config.username, addr);

        let label = format!("{}@{}", self.config.username, addr);
        let controller = spawn_handle_owner_task(handle, label.clone());
        Ok(SshConnection::new(controller, label))
    }
}

/// Client handler for russh callbacks
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self { host, port, policy }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.policy
            .check(&self.host, self.port, server_public_key)
            .map(|()| true)
    }
}

/// Output of a finished remote command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Combined stdout and stderr, in arrival order
    pub output: String,
    pub exit_status: u32,
}

impl CommandOutput {
    fn into_result(self) -> Result<String, SshError> {
        if self.exit_status == 0 {
            Ok(self.output)
        } else {
            Err(SshError::Command {
                exit_status: self.exit_status,
                output: self.output,
            })
        }
    }
}

/// An authenticated SSH transport
///
/// Every command opens its own session channel, so one connection serves any
/// number of concurrent callers.
pub struct SshConnection {
    controller: HandleController,
    label: String,
    connected_at: DateTime<Utc>,
    /// Unix millis of the last successful remote interaction
    last_activity: AtomicI64,
}

impl SshConnection {
    pub fn new(controller: HandleController, label: String) -> Self {
        let now = Utc::now();
        Self {
            controller,
            label,
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run a command, returning combined output. Non-zero exit is an error.
    pub async fn run_command(&self, cmd: &str) -> Result<String, SshError> {
        self.exec(cmd, None).await?.into_result()
    }

    /// Run a command under a remote pseudo-terminal of the given geometry
    pub async fn run_command_with_pty(
        &self,
        cmd: &str,
        cols: u32,
        rows: u32,
    ) -> Result<String, SshError> {
        self.exec(cmd, Some((cols, rows))).await?.into_result()
    }

    pub async fn run_command_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<String, SshError> {
        tokio::time::timeout(timeout, self.run_command(cmd))
            .await
            .map_err(|_| {
                SshError::Timeout(format!("command timed out after {:?}", timeout))
            })?
    }

    /// Run a long-lived command, forwarding output chunks to `sink` as they arrive
    ///
    /// Returns once the command exits. A dropped sink stops forwarding but the
    /// command is still drained to completion.
    pub async fn stream_command(
        &self,
        cmd: &str,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), SshError> {
        let mut channel = self.controller.open_session_channel().await?;
        channel.exec(true, cmd).await?;

        let mut exit_status = None;
        let mut sink = Some(sink);
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    self.touch();
                    if let Some(tx) = &sink {
                        if tx.send(data.to_vec()).await.is_err() {
                            debug!("Stream sink for {} dropped", self.label);
                            sink = None;
                        }
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                    exit_status = Some(status);
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        match exit_status {
            Some(0) => Ok(()),
            Some(status) => Err(SshError::Command {
                exit_status: status,
                output: String::new(),
            }),
            None => Err(SshError::Channel(format!(
                "'{}' ended without an exit status",
                cmd
            ))),
        }
    }

    async fn exec(&self, cmd: &str, pty: Option<(u32, u32)>) -> Result<CommandOutput, SshError> {
        let mut channel = self.controller.open_session_channel().await?;

        if let Some((cols, rows)) = pty {
            channel
                .request_pty(false, PTY_TERM, cols, rows, 0, 0, PTY_MODES)
                .await
                .map_err(|e| SshError::Channel(format!("PTY request failed: {}", e)))?;
        }

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| SshError::Channel(format!("exec failed: {}", e)))?;

        let mut output = Vec::new();
        let mut exit_status = None;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
                // ext=1 is stderr
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => output.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { exit_status: status }) => exit_status = Some(status),
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        let output = String::from_utf8_lossy(&output).into_owned();
        let Some(exit_status) = exit_status else {
            return Err(SshError::Channel(format!(
                "'{}' ended without an exit status",
                cmd
            )));
        };

        self.touch();
        Ok(CommandOutput {
            output,
            exit_status,
        })
    }

    /// Keepalive probe. Never errors; `false` means the transport is dead or unresponsive.
    pub async fn is_connected(&self) -> bool {
        let ok = self.controller.ping().await.is_ok();
        if ok {
            self.touch();
        }
        ok
    }

    /// Probe plus a trivial command
    pub async fn test_connection(&self) -> Result<(), SshError> {
        if !self.is_connected().await {
            return Err(SshError::Disconnected);
        }
        let out = self.run_command_with_timeout("echo test", TEST_TIMEOUT).await?;
        if out.trim() != "test" {
            warn!("Unexpected test output from {}: {:?}", self.label, out);
            return Err(SshError::Channel(format!("unexpected test output {:?}", out)));
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.controller.disconnect().await;
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.connected_at
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
    }

    fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output_into_result() {
        let ok = CommandOutput {
            output: "hello\n".into(),
            exit_status: 0,
        };
        assert_eq!(ok.into_result().unwrap(), "hello\n");

        let failed = CommandOutput {
            output: "No screen session found.\n".into(),
            exit_status: 1,
        };
        match failed.into_result() {
            Err(SshError::Command {
                exit_status,
                output,
            }) => {
                assert_eq!(exit_status, 1);
                assert!(output.contains("No screen session found"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dead_connection_reports_disconnected() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let conn = SshConnection::new(HandleController::new(tx), "ops@test:22".into());

        assert!(!conn.is_connected().await);
        assert!(matches!(
            conn.run_command("uptime").await,
            Err(SshError::Disconnected)
        ));
        assert!(matches!(
            conn.test_connection().await,
            Err(SshError::Disconnected)
        ));
        assert!(conn.last_activity().is_some());
        assert!(conn.uptime() >= chrono::Duration::zero());
    }
}

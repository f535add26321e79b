//! Transport seams
//!
//! The pool and the console engine only see `RemoteTransport` and `Connector`,
//! so they can be driven by scripted transports in tests.

use std::sync::Arc;

use async_trait::async_trait;

use super::client::{SshClient, SshConnection};
use super::config::SshConfig;
use super::error::SshError;

/// A live connection able to run remote commands
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Combined stdout/stderr; non-zero exit is `SshError::Command`
    async fn run_command(&self, cmd: &str) -> Result<String, SshError>;

    /// Same as `run_command` but under a PTY of `cols` x `rows`
    async fn run_command_with_pty(
        &self,
        cmd: &str,
        cols: u32,
        rows: u32,
    ) -> Result<String, SshError>;

    /// Liveness probe, never errors
    async fn is_connected(&self) -> bool;

    async fn close(&self);
}

/// Dials new transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteTransport>, SshError>;
}

#[async_trait]
impl RemoteTransport for SshConnection {
    async fn run_command(&self, cmd: &str) -> Result<String, SshError> {
        SshConnection::run_command(self, cmd).await
    }

    async fn run_command_with_pty(
        &self,
        cmd: &str,
        cols: u32,
        rows: u32,
    ) -> Result<String, SshError> {
        SshConnection::run_command_with_pty(self, cmd, cols, rows).await
    }

    async fn is_connected(&self) -> bool {
        SshConnection::is_connected(self).await
    }

    async fn close(&self) {
        SshConnection::close(self).await
    }
}

/// `Connector` backed by real SSH dials
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteTransport>, SshError> {
        let conn = SshClient::new(config.clone()).connect().await?;
        Ok(Arc::new(conn))
    }
}

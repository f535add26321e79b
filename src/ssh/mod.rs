//! SSH module - connections to managed hosts
//!
//! This module provides the SSH layer using the russh library.
//!
//! # Features
//! - Password and public key authentication
//! - Host key verification via known_hosts with trust on first use
//! - Plain, PTY-backed and streaming remote commands
//! - Connection pool with health checks and bounded reconnects (see `pool`)

mod client;
mod config;
mod error;
mod handle_owner;
pub mod known_hosts;
pub mod pool;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ClientHandler, CommandOutput, SshClient, SshConnection};
pub use config::{AuthMethod, SshConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use known_hosts::{HostKeyPolicy, HostKeyVerification, KnownHostsStore};
pub use pool::{
    ConnectionInfo, ConnectionPool, ConnectionPoolConfig, HealthStatus, PoolEntry, PoolError,
    PoolStats,
};
pub use transport::{Connector, RemoteTransport, SshConnector};

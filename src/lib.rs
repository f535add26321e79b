//! FleetConsole - live multi-viewer consoles for remote game servers
//!
//! Operators watch and drive a GNU screen session on each managed host over
//! SSH. One pooled connection per server, one capture loop per console, any
//! number of viewers per console room.
//!
//! ```text
//!  ConnectionPool ──transport──▶ ConsoleSession ──lines──▶ BroadcastHub ──▶ viewers
//!   (health loop)                 (capture/diff)            (console:<id>)
//! ```

pub mod config;
pub mod console;
pub mod history;
pub mod hub;
pub mod ssh;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{ConfigError, FleetConfig};
use console::{ConnectionHandle, ConsoleError, ConsoleManager, ConsoleSession};
use history::{CommandHistoryStore, ConnectionAudit};
use hub::{console_room, BroadcastHub, HubError, ViewerConnection, ViewerInfo};
use ssh::{ConnectionPool, Connector, PoolError, SshConnector};

/// Initialize logging
///
/// `RUST_LOG` overrides the default `info` filter. Calling it again is a no-op.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Console(#[from] ConsoleError),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl serde::Serialize for FleetError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Top-level wiring of pool, hub and console sessions
pub struct FleetConsole {
    config: FleetConfig,
    pool: Arc<ConnectionPool>,
    hub: Arc<BroadcastHub>,
    manager: ConsoleManager,
}

impl FleetConsole {
    pub fn new(
        config: FleetConfig,
        connector: Arc<dyn Connector>,
        history: Arc<dyn CommandHistoryStore>,
        audit: Arc<dyn ConnectionAudit>,
    ) -> Result<Self, FleetError> {
        config.validate()?;

        let pool = Arc::new(ConnectionPool::new(connector, audit, config.pool.clone()));
        let hub = Arc::new(BroadcastHub::new(config.console.viewer_queue));
        let manager = ConsoleManager::new(
            Arc::clone(&hub),
            history,
            config.console.capture_settings(),
            config.console.log_settings(),
        );

        Ok(Self {
            config,
            pool,
            hub,
            manager,
        })
    }

    /// Same as `new`, dialing real SSH connections
    pub fn with_ssh(
        config: FleetConfig,
        history: Arc<dyn CommandHistoryStore>,
        audit: Arc<dyn ConnectionAudit>,
    ) -> Result<Self, FleetError> {
        Self::new(config, Arc::new(SshConnector), history, audit)
    }

    /// Start the pool's background health loop
    pub fn start(&self) {
        self.pool.start_health_loop();
        info!(
            "Fleet console started with {} servers",
            self.config.servers.len()
        );
    }

    /// Connect to `server_id` if needed and start capturing its console
    ///
    /// Returns the running session when one already exists.
    pub async fn open_console(&self, server_id: &str) -> Result<Arc<ConsoleSession>, FleetError> {
        let server = self
            .config
            .server(server_id)
            .ok_or_else(|| ConfigError::UnknownServer(server_id.to_string()))?;

        if let Some(session) = self.manager.get_session(server_id) {
            if session.is_active() {
                return Ok(session);
            }
        }

        self.pool.get_connection(server_id, &server.ssh).await?;
        let connection = ConnectionHandle::Pooled {
            pool: Arc::clone(&self.pool),
            server_id: server_id.to_string(),
        };

        let session = self
            .manager
            .start_session(server_id, &server.session_name(), connection, server.run_as())
            .await?;
        Ok(session)
    }

    pub async fn close_console(&self, server_id: &str) -> Result<(), FleetError> {
        self.manager.stop_session(server_id).await?;
        Ok(())
    }

    /// Subscribe a viewer to a server's console room
    pub fn join_console(
        &self,
        server_id: &str,
        viewer: ViewerInfo,
    ) -> Result<ViewerConnection, FleetError> {
        Ok(self.hub.join(&console_room(server_id), viewer)?)
    }

    pub fn leave_console(&self, server_id: &str, client_id: &str) -> bool {
        self.hub.leave(&console_room(server_id), client_id)
    }

    /// Delete console logs older than `retention_days` for every configured server
    pub async fn cleanup_logs(&self, retention_days: u32) -> Result<usize, FleetError> {
        let Some(log) = self.config.console.log_settings() else {
            return Ok(0);
        };
        let mut deleted = 0;
        for server in &self.config.servers {
            let dir = console::server_log_dir(&log.dir, &server.id);
            deleted += console::cleanup_old_logs(&dir, retention_days)
                .await
                .map_err(ConsoleError::Log)?;
        }
        Ok(deleted)
    }

    /// Stop every session, disconnect every viewer and close every connection
    pub async fn shutdown(&self) {
        self.manager.stop_all().await;
        self.hub.shutdown();
        self.pool.stop().await;
        info!("Fleet console shut down");
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn consoles(&self) -> &ConsoleManager {
        &self.manager
    }
}

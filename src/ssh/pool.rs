//! SSH Connection Pool
//!
//! One live transport per server id, kept healthy by a background loop.
//!
//! # Health state machine
//!
//! ```text
//!  (absent) ──create──▶ Healthy ──probe fails──▶ Degraded
//!                          ▲                        │
//!                          │ reconnect ok           │ reconnect
//!                          └────────────────────────┤
//!                                                   ▼ reconnect fails
//!                                                 Failed ──(attempts == max)──▶ removed
//! ```
//!
//! A successful probe resets the attempt counter. A removed entry is dialed
//! from scratch on the next `get_connection`.
//!
//! # Locking
//!
//! `entries` is only held for bookkeeping, never across a network call.
//! Dials and reconnects for one server id are serialized by a per-id async
//! mutex, so a slow host never blocks pool access for the others.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::SshConfig;
use super::error::SshError;
use super::transport::{Connector, RemoteTransport};
use crate::history::{ConnectionAudit, ConnectionAuditRecord, ConnectionEvent};

/// 健康检查间隔
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// 连续失败达到该次数后移除连接
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// 连接池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    /// Seconds between health rounds
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// Consecutive failed probes before an entry is dropped
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_health_interval_secs() -> u64 {
    DEFAULT_HEALTH_INTERVAL.as_secs()
}

fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: DEFAULT_HEALTH_INTERVAL.as_secs(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ConnectionPoolConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

/// 连接健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Last probe failed, reconnect in progress
    Degraded,
    /// Last reconnect failed
    Failed,
}

/// Snapshot of one entry
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub server_id: String,
    pub host: String,
    pub port: u16,
    pub status: HealthStatus,
    pub reconnect_attempts: u32,
    pub connected_at: DateTime<Utc>,
    pub last_probe: Option<DateTime<Utc>>,
}

/// 连接池统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub healthy: usize,
    pub degraded: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Connection not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Ssh(#[from] SshError),
}

/// 单个连接条目
pub struct PoolEntry {
    server_id: String,
    /// Descriptor used to re-dial
    config: SshConfig,
    transport: RwLock<Arc<dyn RemoteTransport>>,
    status: RwLock<HealthStatus>,
    reconnect_attempts: AtomicU32,
    connected_at: RwLock<DateTime<Utc>>,
    last_probe: RwLock<Option<DateTime<Utc>>>,
    /// Set while a probe/reconnect for this entry is running
    checking: AtomicBool,
}

impl PoolEntry {
    fn new(server_id: &str, config: SshConfig, transport: Arc<dyn RemoteTransport>) -> Self {
        Self {
            server_id: server_id.to_string(),
            config,
            transport: RwLock::new(transport),
            status: RwLock::new(HealthStatus::Healthy),
            reconnect_attempts: AtomicU32::new(0),
            connected_at: RwLock::new(Utc::now()),
            last_probe: RwLock::new(None),
            checking: AtomicBool::new(false),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn transport(&self) -> Arc<dyn RemoteTransport> {
        self.transport.read().clone()
    }

    pub fn status(&self) -> HealthStatus {
        *self.status.read()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: HealthStatus) -> HealthStatus {
        std::mem::replace(&mut *self.status.write(), status)
    }

    /// Swap in a fresh transport, returning the old one
    fn replace_transport(&self, transport: Arc<dyn RemoteTransport>) -> Arc<dyn RemoteTransport> {
        *self.connected_at.write() = Utc::now();
        std::mem::replace(&mut *self.transport.write(), transport)
    }

    pub fn to_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            server_id: self.server_id.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            status: self.status(),
            reconnect_attempts: self.reconnect_attempts(),
            connected_at: *self.connected_at.read(),
            last_probe: *self.last_probe.read(),
        }
    }
}

/// SSH 连接池
pub struct ConnectionPool {
    entries: DashMap<String, Arc<PoolEntry>>,
    /// Per server id dial lock
    dial_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    connector: Arc<dyn Connector>,
    audit: Arc<dyn ConnectionAudit>,
    config: ConnectionPoolConfig,
    cancel: CancellationToken,
    health_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        audit: Arc<dyn ConnectionAudit>,
        config: ConnectionPoolConfig,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            dial_locks: DashMap::new(),
            connector,
            audit,
            config,
            cancel: CancellationToken::new(),
            health_task: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.config
    }

    /// Return a live transport for `server_id`, dialing if needed
    ///
    /// An existing entry is reused only if it answers a probe; otherwise it is
    /// closed and replaced.
    pub async fn get_connection(
        &self,
        server_id: &str,
        config: &SshConfig,
    ) -> Result<Arc<dyn RemoteTransport>, PoolError> {
        if let Some(transport) = self.probe_existing(server_id).await {
            return Ok(transport);
        }

        let lock = self.dial_lock(server_id);
        let _guard = lock.lock().await;

        // Another caller may have dialed while we waited
        if let Some(transport) = self.probe_existing(server_id).await {
            return Ok(transport);
        }

        info!("Dialing {} ({})", server_id, config.address());
        let transport = self.connector.connect(config).await?;

        let entry = Arc::new(PoolEntry::new(server_id, config.clone(), transport.clone()));
        self.entries.insert(server_id.to_string(), entry);
        self.record(server_id, ConnectionEvent::Connected, HealthStatus::Healthy, 0)
            .await;

        info!("Pooled connection for {} established", server_id);
        Ok(transport)
    }

    /// Existing transport that still answers, or `None` after discarding a dead one
    async fn probe_existing(&self, server_id: &str) -> Option<Arc<dyn RemoteTransport>> {
        let entry = self.entries.get(server_id).map(|e| e.value().clone())?;
        let transport = entry.transport();
        if transport.is_connected().await {
            return Some(transport);
        }

        warn!("Pooled connection for {} is dead, discarding", server_id);
        self.discard(&entry).await;
        None
    }

    /// Remove `entry` if it is still the one registered, then close it
    async fn discard(&self, entry: &Arc<PoolEntry>) {
        let removed = self
            .entries
            .remove_if(&entry.server_id, |_, current| Arc::ptr_eq(current, entry))
            .is_some();
        if removed {
            entry.transport().close().await;
            self.record(
                &entry.server_id,
                ConnectionEvent::Disconnected,
                entry.status(),
                entry.reconnect_attempts(),
            )
            .await;
        }
    }

    fn dial_lock(&self, server_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.dial_locks
            .entry(server_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Lookup without dialing
    pub fn get_existing_connection(&self, server_id: &str) -> Option<Arc<dyn RemoteTransport>> {
        self.entries.get(server_id).map(|e| e.value().transport())
    }

    pub fn get_entry(&self, server_id: &str) -> Option<Arc<PoolEntry>> {
        self.entries.get(server_id).map(|e| e.value().clone())
    }

    /// Close and forget the connection for `server_id`
    pub async fn remove_connection(&self, server_id: &str) -> Result<(), PoolError> {
        let (_, entry) = self
            .entries
            .remove(server_id)
            .ok_or_else(|| PoolError::NotFound(server_id.to_string()))?;

        entry.transport().close().await;
        self.record(
            server_id,
            ConnectionEvent::Disconnected,
            entry.status(),
            entry.reconnect_attempts(),
        )
        .await;
        info!("Removed pooled connection for {}", server_id);
        Ok(())
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            // Already gone is fine here
            let _ = self.remove_connection(&id).await;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for entry in self.entries.iter() {
            match entry.value().status() {
                HealthStatus::Healthy => stats.healthy += 1,
                HealthStatus::Degraded => stats.degraded += 1,
                HealthStatus::Failed => stats.failed += 1,
            }
            stats.total += 1;
        }
        stats
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.entries.iter().map(|e| e.value().to_info()).collect()
    }

    /// Start the periodic health loop. Calling twice is a no-op.
    pub fn start_health_loop(self: &Arc<Self>) {
        let mut slot = self.health_task.lock();
        if slot.is_some() {
            return;
        }

        let pool = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.config.health_interval();

        *slot = Some(tokio::spawn(async move {
            info!("Pool health loop started (interval={}s)", period.as_secs());
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        for entry in pool.snapshot() {
                            pool.spawn_check(entry);
                        }
                    }
                }
            }

            info!("Pool health loop stopped");
        }));
    }

    /// Run one health round and wait for every check to finish
    pub async fn check_health_now(self: &Arc<Self>) {
        let mut set = JoinSet::new();
        for entry in self.snapshot() {
            if entry.checking.swap(true, Ordering::SeqCst) {
                continue;
            }
            let pool = Arc::clone(self);
            set.spawn(async move {
                pool.check_entry(&entry).await;
                entry.checking.store(false, Ordering::SeqCst);
            });
        }
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!("Health check task failed: {}", e);
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<PoolEntry>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Each entry gets its own task; ticks for one entry never overlap
    fn spawn_check(self: &Arc<Self>, entry: Arc<PoolEntry>) {
        if entry.checking.swap(true, Ordering::SeqCst) {
            debug!("Health check for {} still running, skipping tick", entry.server_id);
            return;
        }
        let pool = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = pool.check_entry(&entry) => {}
            }
            entry.checking.store(false, Ordering::SeqCst);
        });
    }

    async fn check_entry(&self, entry: &Arc<PoolEntry>) {
        let server_id = entry.server_id.as_str();
        *entry.last_probe.write() = Some(Utc::now());

        if entry.transport().is_connected().await {
            entry.reconnect_attempts.store(0, Ordering::SeqCst);
            if entry.set_status(HealthStatus::Healthy) != HealthStatus::Healthy {
                info!("Connection {} healthy again", server_id);
                self.record(server_id, ConnectionEvent::Health, HealthStatus::Healthy, 0)
                    .await;
            }
            debug!("Connection {} probe OK", server_id);
            return;
        }

        entry.set_status(HealthStatus::Degraded);
        let attempts = entry.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            "Connection {} probe failed ({}/{}), reconnecting",
            server_id, attempts, self.config.max_reconnect_attempts
        );
        self.record(server_id, ConnectionEvent::Health, HealthStatus::Degraded, attempts)
            .await;

        let lock = self.dial_lock(server_id);
        let reconnect = {
            let _guard = lock.lock().await;
            self.connector.connect(&entry.config).await
        };

        match reconnect {
            Ok(transport) => {
                // The entry may have been removed or replaced while we dialed
                let swapped = match self.entries.get(server_id) {
                    Some(current) if Arc::ptr_eq(current.value(), entry) => {
                        Ok(entry.replace_transport(transport))
                    }
                    _ => Err(transport),
                };
                let old = match swapped {
                    Ok(old) => old,
                    Err(orphan) => {
                        info!(
                            "Connection {} left the pool during reconnect, dropping new transport",
                            server_id
                        );
                        orphan.close().await;
                        return;
                    }
                };
                old.close().await;
                entry.reconnect_attempts.store(0, Ordering::SeqCst);
                entry.set_status(HealthStatus::Healthy);
                info!("Connection {} reconnected", server_id);
                self.record(server_id, ConnectionEvent::Connected, HealthStatus::Healthy, 0)
                    .await;
            }
            Err(e) => {
                entry.set_status(HealthStatus::Failed);
                warn!("Reconnect to {} failed: {}", server_id, e);
                self.record(server_id, ConnectionEvent::Health, HealthStatus::Failed, attempts)
                    .await;

                if attempts >= self.config.max_reconnect_attempts {
                    error!(
                        "Connection {} removed after {} failed attempts",
                        server_id, attempts
                    );
                    self.discard(entry).await;
                }
            }
        }
    }

    async fn record(&self, server_id: &str, event: ConnectionEvent, status: HealthStatus, attempts: u32) {
        let record = ConnectionAuditRecord::new(server_id, event, status, attempts);
        if let Err(e) = self.audit.record(record).await {
            warn!("Failed to record connection event for {}: {}", server_id, e);
        }
    }

    /// Stop the health loop and close every connection
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.close_all().await;
        info!("Connection pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryConnectionAudit;
    use crate::ssh::testing::MockConnector;

    fn pool_with(connector: Arc<MockConnector>) -> (Arc<ConnectionPool>, Arc<InMemoryConnectionAudit>) {
        let audit = Arc::new(InMemoryConnectionAudit::new());
        let pool = Arc::new(ConnectionPool::new(
            connector,
            audit.clone(),
            ConnectionPoolConfig::default(),
        ));
        (pool, audit)
    }

    fn server_config() -> SshConfig {
        SshConfig {
            host: "game-01".into(),
            username: "hytale".into(),
            ..SshConfig::default()
        }
    }

    #[test]
    fn test_pool_config_default() {
        let config = ConnectionPoolConfig::default();
        assert_eq!(config.health_interval_secs, 30);
        assert_eq!(config.max_reconnect_attempts, 3);
    }

    #[tokio::test]
    async fn test_get_connection_reuses_live_entry() {
        let connector = Arc::new(MockConnector::new());
        let (pool, audit) = pool_with(connector.clone());

        pool.get_connection("s1", &server_config()).await.unwrap();
        pool.get_connection("s1", &server_config()).await.unwrap();

        assert_eq!(connector.dial_count(), 1);
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(audit.records_for("s1").len(), 1);
    }

    #[tokio::test]
    async fn test_get_connection_replaces_dead_entry() {
        let connector = Arc::new(MockConnector::new());
        let (pool, _) = pool_with(connector.clone());

        pool.get_connection("s1", &server_config()).await.unwrap();
        let first = connector.last_transport().unwrap();
        first.set_alive(false);

        pool.get_connection("s1", &server_config()).await.unwrap();
        assert_eq!(connector.dial_count(), 2);
        assert!(first.is_closed());
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_three_failed_probes_remove_entry() {
        let connector = Arc::new(MockConnector::new());
        let (pool, audit) = pool_with(connector.clone());

        pool.get_connection("s1", &server_config()).await.unwrap();
        connector.last_transport().unwrap().set_alive(false);
        connector.set_fail(true);

        pool.check_health_now().await;
        let entry = pool.get_entry("s1").unwrap();
        assert_eq!(entry.status(), HealthStatus::Failed);
        assert_eq!(entry.reconnect_attempts(), 1);

        pool.check_health_now().await;
        assert_eq!(pool.get_entry("s1").unwrap().reconnect_attempts(), 2);

        pool.check_health_now().await;
        assert!(pool.get_entry("s1").is_none());
        assert_eq!(pool.stats(), PoolStats::default());

        // Next demand re-dials from scratch
        connector.set_fail(false);
        pool.get_connection("s1", &server_config()).await.unwrap();
        let entry = pool.get_entry("s1").unwrap();
        assert_eq!(entry.reconnect_attempts(), 0);
        assert_eq!(entry.status(), HealthStatus::Healthy);

        let events: Vec<_> = audit.records_for("s1").iter().map(|r| r.event).collect();
        assert!(events.contains(&ConnectionEvent::Disconnected));
        assert_eq!(events.last(), Some(&ConnectionEvent::Connected));
    }

    #[tokio::test]
    async fn test_failed_probe_then_reconnect_resets() {
        let connector = Arc::new(MockConnector::new());
        let (pool, _) = pool_with(connector.clone());

        pool.get_connection("s1", &server_config()).await.unwrap();
        let first = connector.last_transport().unwrap();
        first.set_alive(false);

        pool.check_health_now().await;
        let entry = pool.get_entry("s1").unwrap();
        assert_eq!(entry.status(), HealthStatus::Healthy);
        assert_eq!(entry.reconnect_attempts(), 0);
        assert!(first.is_closed());
        assert_eq!(connector.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_stats_and_remove() {
        let connector = Arc::new(MockConnector::new());
        let (pool, _) = pool_with(connector.clone());

        pool.get_connection("s1", &server_config()).await.unwrap();
        pool.get_connection("s2", &server_config()).await.unwrap();
        assert_eq!(
            pool.stats(),
            PoolStats {
                healthy: 2,
                degraded: 0,
                failed: 0,
                total: 2
            }
        );
        assert_eq!(pool.list_connections().len(), 2);

        pool.remove_connection("s1").await.unwrap();
        assert!(matches!(
            pool.remove_connection("s1").await,
            Err(PoolError::NotFound(_))
        ));
        assert!(pool.get_existing_connection("s1").is_none());
        assert!(pool.get_existing_connection("s2").is_some());

        pool.stop().await;
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_propagates() {
        let connector = Arc::new(MockConnector::new());
        connector.set_fail(true);
        let (pool, _) = pool_with(connector);

        let Err(err) = pool.get_connection("s1", &server_config()).await else {
            panic!("expected dial failure");
        };
        assert!(matches!(err, PoolError::Ssh(SshError::Network(_))));
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_after_removal_closes_new_transport() {
        let connector = Arc::new(MockConnector::new());
        let (pool, audit) = pool_with(connector.clone());

        pool.get_connection("s1", &server_config()).await.unwrap();
        let first = connector.last_transport().unwrap();
        first.set_alive(false);

        let gate = connector.hold_dials();
        let check = tokio::spawn({
            let pool = pool.clone();
            async move { pool.check_health_now().await }
        });
        while connector.dial_count() < 2 {
            tokio::task::yield_now().await;
        }

        pool.remove_connection("s1").await.unwrap();
        gate.add_permits(1);
        check.await.unwrap();

        let second = connector.last_transport().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_closed());
        assert!(pool.get_entry("s1").is_none());

        let events: Vec<_> = audit.records_for("s1").iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![
                ConnectionEvent::Connected,
                ConnectionEvent::Health,
                ConnectionEvent::Disconnected
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_runs_on_interval() {
        let connector = Arc::new(MockConnector::new());
        let (pool, _) = pool_with(connector.clone());

        pool.get_connection("s1", &server_config()).await.unwrap();
        connector.last_transport().unwrap().set_alive(false);
        pool.start_health_loop();

        tokio::time::sleep(Duration::from_secs(31)).await;
        // Let the spawned check finish
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(connector.dial_count(), 2);
        pool.stop().await;
    }
}

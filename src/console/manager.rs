//! Console session registry
//!
//! One capture session per server id. Starting is idempotent and serialized so
//! concurrent callers never spawn a second capture loop for the same server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::error::ConsoleError;
use super::filter::OutputFilter;
use super::log_writer::{server_log_dir, ConsoleLogWriter, LogWriterConfig};
use super::session::{CaptureSettings, CommandActor, ConnectionHandle, ConsoleSession, RunAs};
use crate::history::CommandHistoryStore;
use crate::hub::{console_room, BroadcastHub};

/// Lines returned by `get_historical_output` when the caller asks for 0
pub const DEFAULT_HISTORY_LINES: usize = 100;

/// Where console output is persisted
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Each server logs under `<dir>/<server_id>/`, id sanitized
    pub dir: PathBuf,
    pub max_size_bytes: u64,
    pub max_age: Duration,
}

pub struct ConsoleManager {
    sessions: Mutex<HashMap<String, Arc<ConsoleSession>>>,
    /// Serializes session startup
    start_lock: tokio::sync::Mutex<()>,
    hub: Arc<BroadcastHub>,
    history: Arc<dyn CommandHistoryStore>,
    settings: CaptureSettings,
    log: Option<LogSettings>,
}

impl ConsoleManager {
    pub fn new(
        hub: Arc<BroadcastHub>,
        history: Arc<dyn CommandHistoryStore>,
        settings: CaptureSettings,
        log: Option<LogSettings>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            start_lock: tokio::sync::Mutex::new(()),
            hub,
            history,
            settings,
            log,
        }
    }

    /// Start capturing `session_name` on `server_id`, or return the running session
    pub async fn start_session(
        &self,
        server_id: &str,
        session_name: &str,
        connection: ConnectionHandle,
        run_as: Option<RunAs>,
    ) -> Result<Arc<ConsoleSession>, ConsoleError> {
        if let Some(existing) = self.active_session(server_id) {
            return Ok(existing);
        }

        let _guard = self.start_lock.lock().await;
        if let Some(existing) = self.active_session(server_id) {
            return Ok(existing);
        }

        let log_writer = match &self.log {
            Some(log) => {
                let writer = ConsoleLogWriter::open(LogWriterConfig {
                    server_id: server_id.to_string(),
                    log_dir: server_log_dir(&log.dir, server_id),
                    max_size_bytes: log.max_size_bytes,
                    max_age: log.max_age,
                })
                .await?;
                Some(Arc::new(writer))
            }
            None => None,
        };

        let session = Arc::new(ConsoleSession::new(
            server_id,
            session_name,
            connection,
            run_as,
            self.settings.clone(),
            Arc::clone(&self.hub),
            Arc::clone(&self.history),
            log_writer,
        ));
        session.start();

        self.sessions
            .lock()
            .insert(server_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    fn active_session(&self, server_id: &str) -> Option<Arc<ConsoleSession>> {
        self.sessions
            .lock()
            .get(server_id)
            .filter(|s| s.is_active())
            .cloned()
    }

    pub async fn stop_session(&self, server_id: &str) -> Result<(), ConsoleError> {
        let session = self
            .sessions
            .lock()
            .remove(server_id)
            .ok_or_else(|| ConsoleError::NotFound(server_id.to_string()))?;
        session.stop().await;
        Ok(())
    }

    pub async fn stop_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        for session in sessions {
            session.stop().await;
        }
        if count > 0 {
            info!("Stopped {} console sessions", count);
        }
    }

    pub async fn execute_command(
        &self,
        server_id: &str,
        command: &str,
        actor: &CommandActor,
    ) -> Result<(), ConsoleError> {
        let session = self
            .get_session(server_id)
            .ok_or_else(|| ConsoleError::NotFound(server_id.to_string()))?;
        session.execute_command(command, actor).await
    }

    /// Last `lines` buffered lines, oldest first. 0 means the default of 100.
    pub fn get_historical_output(
        &self,
        server_id: &str,
        lines: usize,
    ) -> Result<Vec<String>, ConsoleError> {
        let session = self
            .get_session(server_id)
            .ok_or_else(|| ConsoleError::NotFound(server_id.to_string()))?;
        let n = if lines == 0 { DEFAULT_HISTORY_LINES } else { lines };
        Ok(session.recent_lines(n))
    }

    /// Like `get_historical_output`, keeping only lines that pass `filter`
    pub fn get_filtered_output(
        &self,
        server_id: &str,
        lines: usize,
        filter: &OutputFilter,
    ) -> Result<Vec<String>, ConsoleError> {
        Ok(filter.filter_lines(self.get_historical_output(server_id, lines)?))
    }

    pub fn get_active_viewer_count(&self, server_id: &str) -> usize {
        self.hub.room_size(&console_room(server_id))
    }

    pub fn get_session(&self, server_id: &str) -> Option<Arc<ConsoleSession>> {
        self.sessions.lock().get(server_id).cloned()
    }

    /// Server ids with a running session
    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, s)| s.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl Drop for ConsoleManager {
    fn drop(&mut self) {
        let sessions = self.sessions.get_mut();
        if !sessions.is_empty() {
            warn!(
                "Console manager dropped with {} running sessions",
                sessions.len()
            );
        }
    }
}

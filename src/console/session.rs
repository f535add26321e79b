//! Console session - capture pipeline for one server
//!
//! ```text
//!  capture task                          broadcast task
//!  ┌─────────────────────────────┐       ┌──────────────────────────┐
//!  │ tick (500ms)                │       │ ring buffer              │
//!  │  resolve `<pid>.<name>`     │ mpsc  │ hub: console:<server_id> │
//!  │  resize (throttled)         ├──────▶│ log file (optional)      │
//!  │  attach 0.1s, diff, clean   │ (100) │                          │
//!  └─────────────────────────────┘       └──────────────────────────┘
//! ```
//!
//! Both tasks stop on the session's cancellation token. An in-flight remote
//! command is abandoned locally; nothing is killed on the host.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::ConsoleError;
use super::filter::OutputFilter;
use super::log_writer::ConsoleLogWriter;
use super::ring_buffer::{RingBuffer, DEFAULT_BUFFER_LINES};
use super::screen::{
    capture_command, diff_screen, normalize_screen, parse_screen_list, resize_script,
    sanitize_line, stuff_command, validate_command, wrap_run_as, LIST_COMMAND, NO_SESSION_MARKER,
};
use crate::history::{CommandHistoryStore, CommandRecord};
use crate::hub::{console_room, BroadcastHub, HubEvent};
use crate::ssh::{ConnectionPool, RemoteTransport, SshError};

/// Lines in flight between capture and broadcast
const OUTPUT_QUEUE: usize = 100;

/// Capture loop tuning
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub interval: Duration,
    pub buffer_lines: usize,
    /// Minimum time between forced redraws of the same target
    pub resize_interval: Duration,
    pub pty_cols: u32,
    pub pty_rows: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            buffer_lines: DEFAULT_BUFFER_LINES,
            resize_interval: Duration::from_secs(30),
            pty_cols: 500,
            pty_rows: 100,
        }
    }
}

/// Identity remote commands run as, via `sudo -n -i -u`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAs {
    pub user: String,
    #[serde(default = "default_true")]
    pub use_sudo: bool,
}

fn default_true() -> bool {
    true
}

/// Who is sending a command
#[derive(Debug, Clone)]
pub struct CommandActor {
    pub user_id: i64,
    pub username: String,
    /// Hub client id of the sender; excluded from the echo broadcast
    pub client_id: Option<String>,
}

/// Where a session gets its transport from on each call
#[derive(Clone)]
pub enum ConnectionHandle {
    /// Whatever the pool currently holds for the server id, so reconnects are picked up
    Pooled {
        pool: Arc<ConnectionPool>,
        server_id: String,
    },
    Fixed(Arc<dyn RemoteTransport>),
}

impl ConnectionHandle {
    pub fn current(&self) -> Option<Arc<dyn RemoteTransport>> {
        match self {
            ConnectionHandle::Pooled { pool, server_id } => pool.get_existing_connection(server_id),
            ConnectionHandle::Fixed(transport) => Some(Arc::clone(transport)),
        }
    }
}

#[derive(Default)]
struct ResizeState {
    target: Option<String>,
    at: Option<Instant>,
}

pub struct ConsoleSession {
    id: String,
    server_id: String,
    /// Logical screen session name
    session_name: String,
    room: String,
    connection: ConnectionHandle,
    run_as: Option<RunAs>,
    settings: CaptureSettings,
    buffer: Mutex<RingBuffer<String>>,
    active: AtomicBool,
    started_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    resize: Mutex<ResizeState>,
    cancel: CancellationToken,
    hub: Arc<BroadcastHub>,
    history: Arc<dyn CommandHistoryStore>,
    log_writer: Option<Arc<ConsoleLogWriter>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsoleSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        server_id: &str,
        session_name: &str,
        connection: ConnectionHandle,
        run_as: Option<RunAs>,
        settings: CaptureSettings,
        hub: Arc<BroadcastHub>,
        history: Arc<dyn CommandHistoryStore>,
        log_writer: Option<Arc<ConsoleLogWriter>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            server_id: server_id.to_string(),
            session_name: session_name.to_string(),
            room: console_room(server_id),
            connection,
            run_as,
            buffer: Mutex::new(RingBuffer::new(settings.buffer_lines)),
            settings,
            active: AtomicBool::new(false),
            started_at: now,
            last_activity: RwLock::new(now),
            resize: Mutex::new(ResizeState::default()),
            cancel: CancellationToken::new(),
            hub,
            history,
            log_writer,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the capture and broadcast tasks
    pub(crate) fn start(self: &Arc<Self>) {
        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE);
        self.active.store(true, Ordering::SeqCst);

        let capture = tokio::spawn(Arc::clone(self).capture_loop(tx));
        let broadcast = tokio::spawn(Arc::clone(self).broadcast_loop(rx));
        self.tasks.lock().extend([capture, broadcast]);

        info!(
            "Started console session {} for server {} (screen: {})",
            self.id, self.server_id, self.session_name
        );
    }

    /// Cancel both tasks and wait for them to exit
    pub(crate) async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        if let Some(writer) = &self.log_writer {
            writer.close().await;
        }
        info!("Stopped console session {} for server {}", self.id, self.server_id);
    }

    async fn capture_loop(self: Arc<Self>, tx: mpsc::Sender<String>) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut prev: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let lines = tokio::select! {
                _ = self.cancel.cancelled() => break,
                lines = self.capture_once(&mut prev) => lines,
            };

            for line in lines {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    sent = tx.send(line) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }

        debug!("Capture loop for {} exited", self.server_id);
    }

    /// One tick: capture, diff against `prev`, return sanitized new lines
    async fn capture_once(&self, prev: &mut Vec<String>) -> Vec<String> {
        let Some(output) = self.capture_screen().await else {
            return Vec::new();
        };

        let image = normalize_screen(&output);
        if image.is_empty() {
            return Vec::new();
        }

        let diff = diff_screen(prev, &image);
        *prev = image;

        diff.into_new_lines()
            .iter()
            .map(|line| sanitize_line(line))
            .filter(|line| !line.is_empty())
            .collect()
    }

    /// Full-screen image of the multiplexer session, or `None` to skip this tick
    async fn capture_screen(&self) -> Option<String> {
        let target = self
            .resolve_target()
            .await
            .unwrap_or_else(|| self.session_name.clone());
        self.ensure_resize(&target).await;

        let output = self.attach_once(&target).await?;
        if !output.contains(NO_SESSION_MARKER) {
            return Some(output);
        }

        // The pid-qualified id may have changed under us
        match self.resolve_target().await {
            Some(resolved) if resolved != target => {
                debug!("Screen target for {} moved to {}", self.server_id, resolved);
                let output = self.attach_once(&resolved).await?;
                (!output.contains(NO_SESSION_MARKER)).then_some(output)
            }
            _ => {
                debug!("No screen session {} on {}", self.session_name, self.server_id);
                None
            }
        }
    }

    async fn attach_once(&self, target: &str) -> Option<String> {
        match self.run_pty(&capture_command(target)).await {
            Ok(output) => Some(output),
            Err(SshError::Command { output, .. }) if output.contains(NO_SESSION_MARKER) => {
                Some(output)
            }
            // timeout(1) exit codes; the screen content is still valid
            Err(SshError::Command {
                exit_status: 1 | 124,
                output,
            }) => Some(output),
            Err(e) => {
                match e.command_output().map(str::trim).filter(|o| !o.is_empty()) {
                    Some(out) => warn!(
                        "Failed to read screen output for {}: {} (output: {})",
                        self.server_id, e, out
                    ),
                    None => warn!("Failed to read screen output for {}: {}", self.server_id, e),
                }
                None
            }
        }
    }

    /// `<pid>.<name>` from `screen -list`
    async fn resolve_target(&self) -> Option<String> {
        // screen -list exits non-zero even when it lists sessions
        let output = match self.run(LIST_COMMAND).await {
            Ok(output) => output,
            Err(SshError::Command { output, .. }) => output,
            Err(e) => {
                debug!("Failed to list screen sessions on {}: {}", self.server_id, e);
                return None;
            }
        };
        parse_screen_list(&output, &self.session_name)
    }

    /// Force a redraw at our PTY width when the target changed or the throttle expired
    async fn ensure_resize(&self, target: &str) {
        let due = {
            let mut state = self.resize.lock();
            let changed = state.target.as_deref() != Some(target);
            let expired = state
                .at
                .map_or(true, |at| at.elapsed() > self.settings.resize_interval);
            if changed || expired {
                state.target = Some(target.to_string());
                state.at = Some(Instant::now());
            }
            changed || expired
        };

        if due {
            if let Err(e) = self.run_pty(&resize_script(target)).await {
                warn!(
                    "Failed to resize screen for {} (target={}): {}",
                    self.server_id, target, e
                );
            }
        }
    }

    async fn broadcast_loop(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = rx.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };

            self.buffer.lock().push(line.clone());
            *self.last_activity.write() = Utc::now();
            self.hub
                .broadcast_to_room(&self.room, HubEvent::console_output(&self.server_id, &line));

            if let Some(writer) = &self.log_writer {
                if let Err(e) = writer.write_line(&line).await {
                    warn!("Failed to write console log for {}: {}", self.server_id, e);
                }
            }
        }

        debug!("Broadcast loop for {} exited", self.server_id);
    }

    /// Validate and type a command into the screen session
    pub async fn execute_command(
        &self,
        command: &str,
        actor: &CommandActor,
    ) -> Result<(), ConsoleError> {
        if !self.is_active() {
            return Err(ConsoleError::Inactive(self.server_id.clone()));
        }

        let clean = validate_command(command.trim())?;
        let result = self.run(&stuff_command(&self.session_name, clean)).await;

        let mut record = CommandRecord::new(
            &self.server_id,
            actor.user_id,
            &actor.username,
            clean,
            result.is_ok(),
        );
        if let Some(output) = result.as_ref().err().and_then(|e| e.command_output()) {
            record = record.with_output(output);
        }
        self.save_history(record);

        match result {
            Ok(_) => {
                *self.last_activity.write() = Utc::now();
                self.hub.broadcast_except(
                    &self.room,
                    HubEvent::command_executed(clean, actor.user_id, &actor.username),
                    actor.client_id.as_deref(),
                );
                info!(
                    "Command executed on {} by {}: {}",
                    self.server_id, actor.username, clean
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Command on {} by {} failed: {}",
                    self.server_id, actor.username, e
                );
                Err(e.into())
            }
        }
    }

    fn save_history(&self, record: CommandRecord) {
        let history = Arc::clone(&self.history);
        tokio::spawn(async move {
            if let Err(e) = history.record(record).await {
                warn!("Failed to save command history: {}", e);
            }
        });
    }

    fn wrap<'a>(&self, cmd: &'a str) -> Cow<'a, str> {
        match &self.run_as {
            Some(run_as) if run_as.use_sudo && !run_as.user.is_empty() => {
                Cow::Owned(wrap_run_as(&run_as.user, cmd))
            }
            _ => Cow::Borrowed(cmd),
        }
    }

    async fn run(&self, cmd: &str) -> Result<String, SshError> {
        let transport = self.connection.current().ok_or(SshError::Disconnected)?;
        transport.run_command(&self.wrap(cmd)).await
    }

    async fn run_pty(&self, cmd: &str) -> Result<String, SshError> {
        let transport = self.connection.current().ok_or(SshError::Disconnected)?;
        transport
            .run_command_with_pty(&self.wrap(cmd), self.settings.pty_cols, self.settings.pty_rows)
            .await
    }

    /// Last `n` buffered lines, oldest first
    pub fn recent_lines(&self, n: usize) -> Vec<String> {
        self.buffer.lock().last(n)
    }

    /// Last `n` buffered lines that pass `filter`
    pub fn filtered_lines(&self, n: usize, filter: &OutputFilter) -> Vec<String> {
        filter.filter_lines(self.recent_lines(n))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read()
    }

    /// File currently receiving this session's output, if logging is on
    pub async fn log_path(&self) -> Option<PathBuf> {
        match &self.log_writer {
            Some(writer) => Some(writer.current_path().await),
            None => None,
        }
    }
}

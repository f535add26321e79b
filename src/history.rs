//! Command history and connection audit recorders
//!
//! Persistence lives outside this crate. The console engine and the pool only
//! talk to these traits, fire-and-forget: a failing recorder is logged and
//! never fails the operation that produced the record.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ssh::HealthStatus;

/// Default page size for history queries
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
/// Default number of autocomplete suggestions
pub const DEFAULT_AUTOCOMPLETE_LIMIT: usize = 10;
/// Output previews are cut to this many bytes
pub const OUTPUT_PREVIEW_LEN: usize = 500;

/// In-memory stores keep at most this many records
const IN_MEMORY_CAPACITY: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("History store unavailable: {0}")]
    Unavailable(String),
}

/// One command sent to a console
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub server_id: String,
    pub user_id: i64,
    pub username: String,
    pub command: String,
    pub executed_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
}

impl CommandRecord {
    pub fn new(server_id: &str, user_id: i64, username: &str, command: &str, success: bool) -> Self {
        Self {
            server_id: server_id.to_string(),
            user_id,
            username: username.to_string(),
            command: command.to_string(),
            executed_at: Utc::now(),
            success,
            output_preview: None,
        }
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.output_preview = Some(preview(output));
        self
    }
}

/// Truncate to `OUTPUT_PREVIEW_LEN` bytes on a char boundary, marking the cut with "..."
pub fn preview(output: &str) -> String {
    if output.len() <= OUTPUT_PREVIEW_LEN {
        return output.to_string();
    }
    let mut end = OUTPUT_PREVIEW_LEN;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &output[..end])
}

fn limit_or(limit: usize, default: usize) -> usize {
    if limit == 0 {
        default
    } else {
        limit
    }
}

/// Command history storage
///
/// Query results are newest first. A `limit` of 0 means the default.
#[async_trait]
pub trait CommandHistoryStore: Send + Sync {
    async fn record(&self, record: CommandRecord) -> Result<(), HistoryError>;

    async fn recent(&self, server_id: &str, limit: usize) -> Result<Vec<CommandRecord>, HistoryError>;

    async fn by_user(&self, user_id: i64, limit: usize) -> Result<Vec<CommandRecord>, HistoryError>;

    /// Case-insensitive substring match
    async fn search(
        &self,
        server_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CommandRecord>, HistoryError>;

    /// Distinct commands starting with `prefix` (case-insensitive)
    async fn autocomplete(
        &self,
        server_id: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<String>, HistoryError>;
}

/// Bounded in-process history
#[derive(Default)]
pub struct InMemoryCommandHistory {
    records: Mutex<VecDeque<CommandRecord>>,
}

impl InMemoryCommandHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn newest_matching<F>(&self, limit: usize, pred: F) -> Vec<CommandRecord>
    where
        F: Fn(&CommandRecord) -> bool,
    {
        self.records
            .lock()
            .iter()
            .rev()
            .filter(|r| pred(r))
            .take(limit)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CommandHistoryStore for InMemoryCommandHistory {
    async fn record(&self, record: CommandRecord) -> Result<(), HistoryError> {
        let mut records = self.records.lock();
        if records.len() >= IN_MEMORY_CAPACITY {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }

    async fn recent(&self, server_id: &str, limit: usize) -> Result<Vec<CommandRecord>, HistoryError> {
        let limit = limit_or(limit, DEFAULT_HISTORY_LIMIT);
        Ok(self.newest_matching(limit, |r| r.server_id == server_id))
    }

    async fn by_user(&self, user_id: i64, limit: usize) -> Result<Vec<CommandRecord>, HistoryError> {
        let limit = limit_or(limit, DEFAULT_HISTORY_LIMIT);
        Ok(self.newest_matching(limit, |r| r.user_id == user_id))
    }

    async fn search(
        &self,
        server_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CommandRecord>, HistoryError> {
        let limit = limit_or(limit, DEFAULT_HISTORY_LIMIT);
        let query = query.to_lowercase();
        Ok(self.newest_matching(limit, |r| {
            r.server_id == server_id && r.command.to_lowercase().contains(&query)
        }))
    }

    async fn autocomplete(
        &self,
        server_id: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<String>, HistoryError> {
        let limit = limit_or(limit, DEFAULT_AUTOCOMPLETE_LIMIT);
        let prefix = prefix.to_lowercase();
        let records = self.records.lock();

        let mut seen = HashSet::new();
        let suggestions = records
            .iter()
            .rev()
            .filter(|r| r.server_id == server_id && r.command.to_lowercase().starts_with(&prefix))
            .filter(|r| seen.insert(r.command.clone()))
            .take(limit)
            .map(|r| r.command.clone())
            .collect();
        Ok(suggestions)
    }
}

/// What happened to a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Health,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionAuditRecord {
    pub server_id: String,
    pub event: ConnectionEvent,
    pub status: HealthStatus,
    pub reconnect_attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl ConnectionAuditRecord {
    pub fn new(server_id: &str, event: ConnectionEvent, status: HealthStatus, attempts: u32) -> Self {
        Self {
            server_id: server_id.to_string(),
            event,
            status,
            reconnect_attempts: attempts,
            timestamp: Utc::now(),
        }
    }
}

/// Connection lifecycle audit sink
#[async_trait]
pub trait ConnectionAudit: Send + Sync {
    async fn record(&self, record: ConnectionAuditRecord) -> Result<(), HistoryError>;
}

/// Audit sink that discards everything
pub struct NoopConnectionAudit;

#[async_trait]
impl ConnectionAudit for NoopConnectionAudit {
    async fn record(&self, _record: ConnectionAuditRecord) -> Result<(), HistoryError> {
        Ok(())
    }
}

/// Audit sink keeping records in memory for inspection
#[derive(Default)]
pub struct InMemoryConnectionAudit {
    records: Mutex<Vec<ConnectionAuditRecord>>,
}

impl InMemoryConnectionAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ConnectionAuditRecord> {
        self.records.lock().clone()
    }

    pub fn records_for(&self, server_id: &str) -> Vec<ConnectionAuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.server_id == server_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ConnectionAudit for InMemoryConnectionAudit {
    async fn record(&self, record: ConnectionAuditRecord) -> Result<(), HistoryError> {
        let mut records = self.records.lock();
        if records.len() >= IN_MEMORY_CAPACITY {
            records.remove(0);
        }
        records.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> InMemoryCommandHistory {
        let history = InMemoryCommandHistory::new();
        for (server, user, cmd) in [
            ("s1", 1, "say hello"),
            ("s1", 2, "whitelist add bob"),
            ("s2", 1, "stop"),
            ("s1", 1, "say goodbye"),
            ("s1", 2, "Say hello"),
            ("s1", 1, "say hello"),
        ] {
            history
                .record(CommandRecord::new(server, user, "op", cmd, true))
                .await
                .unwrap();
        }
        history
    }

    #[tokio::test]
    async fn test_recent_newest_first() {
        let history = seeded().await;
        let recent = history.recent("s1", 2).await.unwrap();
        let cmds: Vec<_> = recent.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(cmds, vec!["say hello", "Say hello"]);

        assert_eq!(history.recent("s1", 0).await.unwrap().len(), 5);
        assert!(history.recent("nope", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_by_user_and_search() {
        let history = seeded().await;
        assert_eq!(history.by_user(2, 0).await.unwrap().len(), 2);

        let found = history.search("s1", "HELLO", 0).await.unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|r| r.server_id == "s1"));
    }

    #[tokio::test]
    async fn test_autocomplete_distinct() {
        let history = seeded().await;
        let suggestions = history.autocomplete("s1", "say", 0).await.unwrap();
        assert_eq!(suggestions, vec!["say hello", "Say hello", "say goodbye"]);

        let one = history.autocomplete("s1", "say", 1).await.unwrap();
        assert_eq!(one, vec!["say hello"]);
    }

    #[test]
    fn test_preview_truncation() {
        assert_eq!(preview("short"), "short");

        let long = "é".repeat(300); // 600 bytes
        let cut = preview(&long);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= OUTPUT_PREVIEW_LEN + 3);
        assert_eq!(cut.trim_end_matches("...").len(), OUTPUT_PREVIEW_LEN);
    }

    #[tokio::test]
    async fn test_audit_records() {
        let audit = InMemoryConnectionAudit::new();
        audit
            .record(ConnectionAuditRecord::new(
                "s1",
                ConnectionEvent::Connected,
                HealthStatus::Healthy,
                0,
            ))
            .await
            .unwrap();
        NoopConnectionAudit
            .record(ConnectionAuditRecord::new(
                "s1",
                ConnectionEvent::Disconnected,
                HealthStatus::Failed,
                3,
            ))
            .await
            .unwrap();

        assert_eq!(audit.records().len(), 1);
        assert_eq!(audit.records_for("s1")[0].event, ConnectionEvent::Connected);
        assert!(audit.records_for("s2").is_empty());
    }
}

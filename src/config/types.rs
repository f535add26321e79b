//! Configuration Types

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::storage::ConfigError;
use crate::console::{safe_session_name, CaptureSettings, LogSettings, RunAs};
use crate::hub::DEFAULT_VIEWER_QUEUE;
use crate::ssh::{ConnectionPoolConfig, SshConfig};

/// Current config format version
pub const CONFIG_VERSION: u32 = 1;

/// Pool tuning as it appears in the config file
pub type PoolSettings = ConnectionPoolConfig;

/// One managed game server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Stable server id, also the hub room suffix
    pub id: String,

    /// How to reach the host
    pub ssh: SshConfig,

    /// screen session name; `hytale-<id>` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,

    /// Account the game server runs under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<String>,

    /// Wrap remote commands in `sudo -n -i -u <run_as_user>`
    #[serde(default)]
    pub use_sudo: bool,
}

impl ServerDescriptor {
    pub fn session_name(&self) -> String {
        match &self.session_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => safe_session_name(&self.id),
        }
    }

    pub fn run_as(&self) -> Option<RunAs> {
        self.run_as_user
            .as_ref()
            .filter(|user| !user.is_empty())
            .map(|user| RunAs {
                user: user.clone(),
                use_sudo: self.use_sudo,
            })
    }
}

/// Console capture and logging options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleSettings {
    #[serde(default = "default_capture_interval_ms")]
    pub capture_interval_ms: u64,

    #[serde(default = "default_buffer_lines")]
    pub buffer_lines: usize,

    #[serde(default = "default_resize_interval_secs")]
    pub resize_interval_secs: u64,

    #[serde(default = "default_pty_cols")]
    pub pty_cols: u32,

    #[serde(default = "default_pty_rows")]
    pub pty_rows: u32,

    /// Per-viewer event queue depth
    #[serde(default = "default_viewer_queue")]
    pub viewer_queue: usize,

    /// Console log root. Logging is off when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Rotate log files at this size (0 = never)
    #[serde(default = "default_log_max_size_bytes")]
    pub log_max_size_bytes: u64,

    /// Rotate log files at this age (0 = never)
    #[serde(default = "default_log_max_age_secs")]
    pub log_max_age_secs: u64,
}

fn default_capture_interval_ms() -> u64 {
    500
}

fn default_buffer_lines() -> usize {
    crate::console::DEFAULT_BUFFER_LINES
}

fn default_resize_interval_secs() -> u64 {
    30
}

fn default_pty_cols() -> u32 {
    500
}

fn default_pty_rows() -> u32 {
    100
}

fn default_viewer_queue() -> usize {
    DEFAULT_VIEWER_QUEUE
}

fn default_log_max_size_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_log_max_age_secs() -> u64 {
    24 * 60 * 60
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            capture_interval_ms: default_capture_interval_ms(),
            buffer_lines: default_buffer_lines(),
            resize_interval_secs: default_resize_interval_secs(),
            pty_cols: default_pty_cols(),
            pty_rows: default_pty_rows(),
            viewer_queue: default_viewer_queue(),
            log_dir: None,
            log_max_size_bytes: default_log_max_size_bytes(),
            log_max_age_secs: default_log_max_age_secs(),
        }
    }
}

impl ConsoleSettings {
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            interval: Duration::from_millis(self.capture_interval_ms.max(1)),
            buffer_lines: self.buffer_lines,
            resize_interval: Duration::from_secs(self.resize_interval_secs),
            pty_cols: self.pty_cols,
            pty_rows: self.pty_rows,
        }
    }

    pub fn log_settings(&self) -> Option<LogSettings> {
        self.log_dir.as_ref().map(|dir| LogSettings {
            dir: dir.clone(),
            max_size_bytes: self.log_max_size_bytes,
            max_age: Duration::from_secs(self.log_max_age_secs),
        })
    }
}

/// Root configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,

    #[serde(default)]
    pub console: ConsoleSettings,

    #[serde(default)]
    pub pool: PoolSettings,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            servers: Vec::new(),
            console: ConsoleSettings::default(),
            pool: PoolSettings::default(),
        }
    }
}

impl FleetConfig {
    pub fn server(&self, id: &str) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Reject empty or duplicate server ids and empty hosts
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.id.is_empty() {
                return Err(ConfigError::Invalid("server with empty id".into()));
            }
            if !seen.insert(server.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server id: {}",
                    server.id
                )));
            }
            if server.ssh.host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server {} has an empty host",
                    server.id
                )));
            }
        }
        if self.console.buffer_lines == 0 {
            return Err(ConfigError::Invalid("console.buffer_lines must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "servers": [
            {
                "id": "eu-1",
                "ssh": {
                    "host": "10.0.0.5",
                    "username": "deploy",
                    "auth": { "type": "key", "key_path": "/keys/id_ed25519" }
                },
                "run_as_user": "hytale",
                "use_sudo": true
            },
            {
                "id": "us 2",
                "ssh": {
                    "host": "10.0.1.9",
                    "port": 2222,
                    "username": "hytale",
                    "auth": { "type": "password", "password": "pw" }
                },
                "session_name": "main"
            }
        ],
        "console": { "capture_interval_ms": 250 }
    }"#;

    #[test]
    fn test_parse_with_defaults() {
        let config: FleetConfig = serde_json::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.console.capture_interval_ms, 250);
        assert_eq!(config.console.buffer_lines, 1000);
        assert_eq!(config.console.pty_cols, 500);
        assert_eq!(config.pool.health_interval_secs, 30);
        assert!(config.console.log_settings().is_none());

        let eu = config.server("eu-1").unwrap();
        assert_eq!(eu.ssh.port, 22);
        assert_eq!(eu.session_name(), "hytale-eu-1");
        assert_eq!(
            eu.run_as(),
            Some(RunAs {
                user: "hytale".into(),
                use_sudo: true
            })
        );

        let us = config.server("us 2").unwrap();
        assert_eq!(us.session_name(), "main");
        assert_eq!(us.ssh.port, 2222);
        assert!(us.run_as().is_none());
    }

    #[test]
    fn test_capture_settings_conversion() {
        let settings = ConsoleSettings {
            log_dir: Some(PathBuf::from("/var/log/fleet")),
            ..ConsoleSettings::default()
        };
        let capture = settings.capture_settings();
        assert_eq!(capture.interval, Duration::from_millis(500));
        assert_eq!(capture.resize_interval, Duration::from_secs(30));

        let log = settings.log_settings().unwrap();
        assert_eq!(log.dir, PathBuf::from("/var/log/fleet"));
        assert_eq!(log.max_age, Duration::from_secs(86400));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_empty_hosts() {
        let mut config: FleetConfig = serde_json::from_str(SAMPLE).unwrap();
        config.servers[1].id = "eu-1".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config: FleetConfig = serde_json::from_str(SAMPLE).unwrap();
        config.servers[0].ssh.host = " ".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}

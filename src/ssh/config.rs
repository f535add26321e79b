//! SSH Configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// SSH connection configuration for one managed host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Dial timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// known_hosts file used for host key verification.
    /// `None` disables verification entirely (every key is accepted with a warning).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,

    /// Trust On First Use
    /// - true: unknown hosts are accepted and appended to known_hosts
    /// - false: unknown hosts are rejected
    ///
    /// Changed keys are rejected either way.
    #[serde(default = "default_true")]
    pub trust_on_first_use: bool,
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }
}

impl SshConfig {
    /// `host:port`, used for dialing and in log lines
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: AuthMethod::Password {
                password: String::new(),
            },
            timeout_secs: 30,
            known_hosts_path: None,
            trust_on_first_use: true,
        }
    }
}

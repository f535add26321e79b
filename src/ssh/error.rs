//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    /// Dial, resolve or transport failure. Worth retrying.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Host key verification failed: {0}")]
    HostKeyMismatch(String),

    /// Remote command ran but exited non-zero. `output` is the combined stdout/stderr.
    #[error("Command exited with status {exit_status}")]
    Command { exit_status: u32, output: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Whether the caller may reasonably retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SshError::Network(_) | SshError::Timeout(_) | SshError::Disconnected
        )
    }

    /// Combined output of a failed command, if any.
    pub fn command_output(&self) -> Option<&str> {
        match self {
            SshError::Command { output, .. } => Some(output),
            _ => None,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => SshError::Disconnected,
            russh::Error::IO(e) => SshError::Io(e),
            other => SshError::Network(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::Key(err.to_string())
    }
}

// Surfaced to API collaborators as plain strings
impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SshError::Network("refused".into()).is_retryable());
        assert!(SshError::Timeout("dial".into()).is_retryable());
        assert!(SshError::Disconnected.is_retryable());
        assert!(!SshError::Authentication("denied".into()).is_retryable());
        assert!(!SshError::HostKeyMismatch("changed".into()).is_retryable());
    }

    #[test]
    fn test_command_output() {
        let err = SshError::Command {
            exit_status: 1,
            output: "No screen session found.".into(),
        };
        assert_eq!(err.command_output(), Some("No screen session found."));
        assert_eq!(err.to_string(), "Command exited with status 1");
        assert!(SshError::Disconnected.command_output().is_none());
    }
}

//! Console error types

use thiserror::Error;

use super::screen::CommandRejection;
use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("Invalid command: {0}")]
    Validation(#[from] CommandRejection),

    #[error("No console session for server {0}")]
    NotFound(String),

    #[error("Console session for server {0} is not active")]
    Inactive(String),

    #[error("Log file error: {0}")]
    Log(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] SshError),
}

impl serde::Serialize for ConsoleError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

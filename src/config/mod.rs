//! Configuration Management Module
//!
//! Persistent fleet configuration: managed servers, console capture options
//! and connection pool tuning.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, log_dir, ConfigError, ConfigStorage};
pub use types::{
    ConsoleSettings, FleetConfig, PoolSettings, ServerDescriptor, CONFIG_VERSION,
};

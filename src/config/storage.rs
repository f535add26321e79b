//! Configuration Storage
//!
//! Reads and writes the fleet config file.
//! Config location: ~/.fleetconsole on macOS/Linux, %APPDATA%\FleetConsole on Windows

use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{FleetConfig, CONFIG_VERSION};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Get the configuration directory
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("FleetConsole"));
        }
        dirs::home_dir()
            .map(|home| home.join(".fleetconsole"))
            .ok_or(ConfigError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".fleetconsole"))
            .ok_or(ConfigError::NoConfigDir)
    }
}

/// Default console log root
pub fn log_dir() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("logs"))
}

/// Get the config file path
pub fn config_file() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Storage at the default path
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            path: config_file()?,
        })
    }

    /// Storage at a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load and validate the config
    ///
    /// A missing file yields the default config. A corrupted file is backed up
    /// and replaced by the default.
    pub async fn load(&self) -> Result<FleetConfig, ConfigError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FleetConfig::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = match serde_json::from_str::<FleetConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                // 配置文件损坏
                tracing::warn!("Config file corrupted: {}", e);
                match self.backup().await {
                    Ok(backup_path) => tracing::warn!(
                        "Corrupted config backed up to {:?}, using defaults",
                        backup_path
                    ),
                    Err(backup_err) => {
                        tracing::error!("Failed to backup corrupted config: {}", backup_err)
                    }
                }
                return Ok(FleetConfig::default());
            }
        };

        if config.version > CONFIG_VERSION {
            return Err(ConfigError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }
        config.validate()?;
        Ok(config)
    }

    /// Save the config (write temp file, then rename)
    pub async fn save(&self, config: &FleetConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.ensure_dir().await?;

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Copy the current file next to itself with a timestamp suffix
    pub async fn backup(&self) -> Result<PathBuf, ConfigError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerDescriptor;
    use crate::ssh::{AuthMethod, SshConfig};
    use tempfile::tempdir;

    fn server(id: &str) -> ServerDescriptor {
        ServerDescriptor {
            id: id.into(),
            ssh: SshConfig {
                host: "10.0.0.5".into(),
                username: "hytale".into(),
                auth: AuthMethod::password("pw"),
                ..SshConfig::default()
            },
            session_name: None,
            run_as_user: None,
            use_sudo: false,
        }
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("config.json"));

        let config = storage.load().await.unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert!(config.servers.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("nested").join("config.json"));

        let mut config = FleetConfig::default();
        config.servers.push(server("eu-1"));
        storage.save(&config).await.unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded.servers.len(), 1);
        assert_eq!(loaded.servers[0].id, "eu-1");
        assert!(!temp.path().join("nested").join("config.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupted_file_backed_up() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let storage = ConfigStorage::with_path(path);

        let config = storage.load().await.unwrap();
        assert!(config.servers.is_empty());

        let backups = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".backup."))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();

        let result = ConfigStorage::with_path(path).load().await;
        assert!(matches!(
            result,
            Err(ConfigError::VersionTooNew { found: 99, .. })
        ));
    }

    #[tokio::test]
    async fn test_save_rejects_invalid() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("config.json"));

        let mut config = FleetConfig::default();
        config.servers.push(server("dup"));
        config.servers.push(server("dup"));
        assert!(matches!(
            storage.save(&config).await,
            Err(ConfigError::Invalid(_))
        ));
        assert!(!storage.exists().await);
    }
}

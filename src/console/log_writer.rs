//! Console log files
//!
//! Appends captured lines to `<log_dir>/console_<timestamp>.log`, one
//! `[YYYY-MM-DD HH:MM:SS] line` entry per line, rotating by size or age.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::Local;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::screen::sanitize_identifier;

const FILE_PREFIX: &str = "console_";
const FILE_SUFFIX: &str = ".log";

#[derive(Debug, Clone)]
pub struct LogWriterConfig {
    pub server_id: String,
    pub log_dir: PathBuf,
    /// Rotate once the file reaches this size. 0 disables.
    pub max_size_bytes: u64,
    /// Rotate once the file is this old. Zero disables.
    pub max_age: Duration,
}

struct WriterState {
    file: Option<File>,
    path: PathBuf,
    written: u64,
    opened_at: Instant,
}

pub struct ConsoleLogWriter {
    config: LogWriterConfig,
    state: Mutex<WriterState>,
}

impl ConsoleLogWriter {
    /// Create the log directory if needed and open a fresh file
    pub async fn open(config: LogWriterConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.log_dir).await?;
        let (file, path) = open_new_file(&config.log_dir).await?;

        info!(
            "Console log for {} writing to {}",
            config.server_id,
            path.display()
        );

        Ok(Self {
            config,
            state: Mutex::new(WriterState {
                file: Some(file),
                path,
                written: 0,
                opened_at: Instant::now(),
            }),
        })
    }

    /// Append one timestamped line and flush
    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut state = self.state.lock().await;

        if self.should_rotate(&state) {
            self.rotate(&mut state).await?;
        }

        let entry = format!("[{}] {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), line);
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "log writer closed"))?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;
        state.written += entry.len() as u64;
        Ok(())
    }

    fn should_rotate(&self, state: &WriterState) -> bool {
        let by_size = self.config.max_size_bytes > 0 && state.written >= self.config.max_size_bytes;
        let by_age = !self.config.max_age.is_zero() && state.opened_at.elapsed() >= self.config.max_age;
        by_size || by_age
    }

    async fn rotate(&self, state: &mut WriterState) -> io::Result<()> {
        if let Some(mut old) = state.file.take() {
            old.flush().await?;
        }
        let (file, path) = open_new_file(&self.config.log_dir).await?;
        info!(
            "Rotated console log for {}: {} -> {}",
            self.config.server_id,
            state.path.display(),
            path.display()
        );
        state.file = Some(file);
        state.path = path;
        state.written = 0;
        state.opened_at = Instant::now();
        Ok(())
    }

    pub async fn current_path(&self) -> PathBuf {
        self.state.lock().await.path.clone()
    }

    /// Flush and close. Later writes fail.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut file) = state.file.take() {
            if let Err(e) = file.flush().await {
                warn!("Failed to flush console log {}: {}", state.path.display(), e);
            }
        }
    }
}

/// `<root>/<server_id>` with the id reduced to `[A-Za-z0-9_-]`
pub fn server_log_dir(root: &Path, server_id: &str) -> PathBuf {
    let name = sanitize_identifier(server_id);
    if name.is_empty() {
        root.join("_")
    } else {
        root.join(name)
    }
}

/// New file named after the current local time; a counter avoids clobbering
/// a file opened within the same second
async fn open_new_file(dir: &Path) -> io::Result<(File, PathBuf)> {
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let mut path = dir.join(format!("{}{}{}", FILE_PREFIX, stamp, FILE_SUFFIX));
    let mut n = 1;
    while fs::try_exists(&path).await? {
        path = dir.join(format!("{}{}_{}{}", FILE_PREFIX, stamp, n, FILE_SUFFIX));
        n += 1;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    Ok((file, path))
}

/// Delete `console_*.log` files in `dir` last modified more than `retention_days` ago
///
/// Returns how many files were removed. A missing directory removes nothing.
pub async fn cleanup_old_logs(dir: &Path, retention_days: u32) -> io::Result<usize> {
    let retention = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut deleted = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(FILE_PREFIX) || !name.ends_with(FILE_SUFFIX) {
            continue;
        }

        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                warn!("Failed to stat {}: {}", entry.path().display(), e);
                continue;
            }
        };
        if modified >= cutoff {
            continue;
        }

        match fs::remove_file(entry.path()).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!("Failed to delete {}: {}", entry.path().display(), e),
        }
    }

    info!(
        "Cleaned up {} old console logs in {} (retention: {} days)",
        deleted,
        dir.display(),
        retention_days
    );
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &Path, max_size_bytes: u64) -> LogWriterConfig {
        LogWriterConfig {
            server_id: "s1".into(),
            log_dir: dir.join("logs"),
            max_size_bytes,
            max_age: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_write_line_format() {
        let dir = tempdir().unwrap();
        let writer = ConsoleLogWriter::open(config(dir.path(), 0)).await.unwrap();

        writer.write_line("[INFO] Server started").await.unwrap();
        writer.write_line("second").await.unwrap();

        let path = writer.current_path().await;
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("console_") && name.ends_with(".log"));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        // [YYYY-MM-DD HH:MM:SS] is 21 chars
        assert_eq!(&lines[0][..1], "[");
        assert_eq!(&lines[0][20..], "] [INFO] Server started");
        assert!(lines[1].ends_with("] second"));
    }

    #[tokio::test]
    async fn test_rotates_by_size() {
        let dir = tempdir().unwrap();
        let writer = ConsoleLogWriter::open(config(dir.path(), 10)).await.unwrap();

        let first = writer.current_path().await;
        writer.write_line("this line is long enough").await.unwrap();
        writer.write_line("next").await.unwrap();
        let second = writer.current_path().await;

        assert_ne!(first, second);
        assert!(std::fs::read_to_string(&second).unwrap().ends_with("] next\n"));
    }

    #[tokio::test]
    async fn test_closed_writer_rejects_writes() {
        let dir = tempdir().unwrap();
        let writer = ConsoleLogWriter::open(config(dir.path(), 0)).await.unwrap();
        writer.close().await;
        assert!(writer.write_line("late").await.is_err());
    }

    #[test]
    fn test_server_log_dir_stays_under_root() {
        let root = Path::new("/var/log/fleet");
        assert_eq!(server_log_dir(root, "eu-1"), root.join("eu-1"));
        assert_eq!(server_log_dir(root, "../x"), root.join("---x"));
        assert_eq!(server_log_dir(root, "/abs"), root.join("-abs"));
        assert_eq!(server_log_dir(root, ""), root.join("_"));
    }

    #[tokio::test]
    async fn test_cleanup_old_logs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("console_2020-01-01_00-00-00.log"), "old").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        // Nothing is older than a year
        assert_eq!(cleanup_old_logs(dir.path(), 365).await.unwrap(), 0);
        // Everything written before now is past a zero-day retention
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cleanup_old_logs(dir.path(), 0).await.unwrap(), 1);
        assert!(dir.path().join("notes.txt").exists());

        assert_eq!(
            cleanup_old_logs(&dir.path().join("missing"), 1).await.unwrap(),
            0
        );
    }
}

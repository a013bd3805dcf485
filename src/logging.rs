// Logging Setup
//
// Stderr output filtered by RUST_LOG, plus the append-only debug log in the
// global directory when debug mode is on.

use crate::config::GatewayConfig;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub fn init_logging(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let file_layer = if config.debug {
        DebugLog::open(&config.log_path(), LOG_MAX_AGE).map(|log| {
            fmt::layer()
                .with_writer(Mutex::new(log))
                .with_ansi(false)
                .with_filter(LevelFilter::DEBUG)
        })
    } else {
        None
    };

    // Already initialised (tests, embedding apps) is fine.
    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}

/// Append-only debug log that rotates itself once the current file is older than `max_age`.
pub struct DebugLog {
    path: PathBuf,
    file: File,
    started: SystemTime,
    max_age: Duration,
}

impl DebugLog {
    /// Any failure here just means no debug log.
    pub fn open(path: &Path, max_age: Duration) -> Option<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok()?;
        }
        let _ = rotate_if_stale(path, SystemTime::now(), max_age);
        let file = open_append(path).ok()?;
        let started = file_started(path).unwrap_or_else(|_| SystemTime::now());

        Some(Self {
            path: path.to_path_buf(),
            file,
            started,
            max_age,
        })
    }

    fn rotate_if_due(&mut self, now: SystemTime) -> std::io::Result<()> {
        if now.duration_since(self.started).unwrap_or_default() <= self.max_age {
            return Ok(());
        }
        self.file.flush()?;
        std::fs::rename(&self.path, rotated_path(&self.path))?;
        self.file = open_append(&self.path)?;
        self.started = now;
        Ok(())
    }
}

impl Write for DebugLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // A failed rotation keeps appending to the current file.
        let _ = self.rotate_if_due(SystemTime::now());
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// First-write time of the log: creation time where the filesystem records it.
fn file_started(path: &Path) -> std::io::Result<SystemTime> {
    let meta = std::fs::metadata(path)?;
    meta.created().or_else(|_| meta.modified())
}

pub fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".prev");
    PathBuf::from(name)
}

/// Renames the log to `<name>.prev` once it was started more than `max_age` ago.
pub fn rotate_if_stale(path: &Path, now: SystemTime, max_age: Duration) -> std::io::Result<bool> {
    let started = match file_started(path) {
        Ok(started) => started,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let age = now.duration_since(started).unwrap_or_default();
    if age <= max_age {
        return Ok(false);
    }
    std::fs::rename(path, rotated_path(path))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_log_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("interceptor.log");
        std::fs::write(&log, "line\n").unwrap();

        assert!(!rotate_if_stale(&log, SystemTime::now(), LOG_MAX_AGE).unwrap());
        assert!(log.exists());
    }

    #[test]
    fn stale_log_moves_to_prev() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("interceptor.log");
        std::fs::write(&log, "old\n").unwrap();
        std::fs::write(rotated_path(&log), "older\n").unwrap();

        let later = SystemTime::now() + LOG_MAX_AGE + Duration::from_secs(60);
        assert!(rotate_if_stale(&log, later, LOG_MAX_AGE).unwrap());

        assert!(!log.exists());
        let prev = dir.path().join("interceptor.log.prev");
        assert_eq!(std::fs::read_to_string(prev).unwrap(), "old\n");
    }

    #[test]
    fn long_running_log_rotates_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interceptor.log");
        let mut log = DebugLog::open(&path, LOG_MAX_AGE).unwrap();
        log.write_all(b"day one\n").unwrap();

        // Appends keep mtime fresh; age is measured from when the file was started.
        log.started = SystemTime::now() - LOG_MAX_AGE - Duration::from_secs(60);
        log.write_all(b"day two\n").unwrap();
        log.flush().unwrap();

        assert_eq!(std::fs::read_to_string(rotated_path(&path)).unwrap(), "day one\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "day two\n");
    }

    #[test]
    fn young_log_keeps_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interceptor.log");
        let mut log = DebugLog::open(&path, LOG_MAX_AGE).unwrap();
        log.write_all(b"a\n").unwrap();
        log.write_all(b"b\n").unwrap();

        assert!(!rotated_path(&path).exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }

    #[test]
    fn missing_log_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("interceptor.log");
        assert!(!rotate_if_stale(&log, SystemTime::now(), LOG_MAX_AGE).unwrap());
    }
}

//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global `tracing` subscriber from [`LogConfig`]
//! - Write text or JSON lines to stderr or to a log file
//! - Reopen the log file on request, so external rotation can move it away
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level
//! - The file is shared behind a mutex; reopening swaps the handle under
//!   the same lock writers take

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::schema::{LogConfig, LogFormat};

/// Error type for logging setup.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("cannot open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid log level '{level}': {reason}")]
    Level { level: String, reason: String },

    #[error("logging already initialized: {0}")]
    Init(String),
}

/// Log file that can be reopened at the same path.
#[derive(Debug, Clone)]
pub struct ReopenableFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl ReopenableFile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LoggingError> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the current handle and open the path again.
    pub fn reopen(&self) -> Result<(), LoggingError> {
        let file = open_append(&self.path)?;
        let mut current = self.lock();
        let _ = current.flush();
        *current = file;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn open_append(path: &Path) -> Result<File, LoggingError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// Writer handed to the fmt layer for one event.
pub struct FileWriter<'a> {
    file: &'a ReopenableFile,
}

impl Write for FileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        // One lock per event line, so reopening never splits a line.
        self.file.lock().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for ReopenableFile {
    type Writer = FileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriter { file: self }
    }
}

/// Keeps what logging needs after initialization.
#[derive(Debug, Clone, Default)]
pub struct LogHandle {
    file: Option<ReopenableFile>,
}

impl LogHandle {
    /// Reopen the log file. A no-op when logging to stderr.
    pub fn reopen(&self) -> Result<(), LoggingError> {
        match &self.file {
            Some(file) => {
                file.reopen()?;
                tracing::info!(path = %file.path().display(), "Log file reopened");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file.as_ref().map(ReopenableFile::path)
    }
}

fn env_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| LoggingError::Level {
        level: level.to_string(),
        reason: e.to_string(),
    })
}

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    match format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
    }
}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> Result<LogHandle, LoggingError> {
    let filter = env_filter(&config.level)?;

    let (layer, file) = match &config.file_path {
        Some(path) => {
            let file = ReopenableFile::open(path)?;
            (fmt_layer(config.format, file.clone(), false), Some(file))
        }
        None => (fmt_layer(config.format, io::stderr, true), None),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(LogHandle { file })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn reopen_follows_renamed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.log");
        let file = ReopenableFile::open(&path).unwrap();

        file.make_writer().write_all(b"before\n").unwrap();
        let rotated = dir.path().join("proxy.log.1");
        fs::rename(&path, &rotated).unwrap();

        file.reopen().unwrap();
        file.make_writer().write_all(b"after\n").unwrap();

        assert_eq!(fs::read_to_string(&rotated).unwrap(), "before\n");
        assert_eq!(fs::read_to_string(&path).unwrap(), "after\n");
    }

    #[test]
    fn rejects_invalid_level() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(matches!(env_filter("dynproxy=loud"), Err(LoggingError::Level { .. })));
    }

    #[test]
    fn stderr_handle_reopen_is_noop() {
        let handle = LogHandle::default();
        assert!(handle.reopen().is_ok());
        assert!(handle.file_path().is_none());
    }
}

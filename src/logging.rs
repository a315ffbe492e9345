//! Process-wide logging service.
//!
//! [`LogService`] installs the global `tracing` subscriber once at startup
//! and owns the background writer for the daily-rotated log file. It is
//! constructed by the composition root and closed on shutdown, which
//! flushes any buffered lines.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

/// Environment variable overriding the configured filter.
pub const LOG_ENV_VAR: &str = "POLIS_LOG";

const LOG_FILE_PREFIX: &str = "polis";
const LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Error)]
pub enum LogError {
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,

    #[error("log directory init failed: {0}")]
    Io(#[from] io::Error),

    #[error("log file appender init failed: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),

    #[error("invalid log filter `{filter}`: {reason}")]
    Filter { filter: String, reason: String },
}

/// Owns the installed subscriber's file writer.
pub struct LogService {
    dir: Option<PathBuf>,
    guard: Option<WorkerGuard>,
}

impl std::fmt::Debug for LogService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogService")
            .field("dir", &self.dir)
            .field("file_writer", &self.guard.is_some())
            .finish()
    }
}

impl LogService {
    /// Build and install the global subscriber described by `config`.
    ///
    /// The filter comes from `POLIS_LOG` if set, else `config.level`.
    ///
    /// # Errors
    ///
    /// [`LogError::AlreadyInstalled`] if a global subscriber exists;
    /// [`LogError::Io`] or [`LogError::Appender`] if the log directory or
    /// file cannot be set up.
    pub fn open(config: &LoggingConfig) -> Result<Self, LogError> {
        let filter = match std::env::var(LOG_ENV_VAR) {
            Ok(directives) if !directives.trim().is_empty() => parse_filter(&directives)?,
            _ => parse_filter(&config.level)?,
        };

        let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
        if config.stdout {
            layers.push(Box::new(tracing_subscriber::fmt::layer().with_target(true)));
        }

        let mut guard = None;
        let mut dir = None;
        if config.file {
            std::fs::create_dir_all(&config.dir)?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .filename_suffix(LOG_FILE_SUFFIX)
                .max_log_files(config.max_files.max(1))
                .build(&config.dir)?;
            let (writer, worker) = tracing_appender::non_blocking(appender);
            layers.push(Box::new(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true),
            ));
            guard = Some(worker);
            dir = Some(config.dir.clone());
        }

        layers.push(Box::new(filter));
        Registry::default()
            .with(layers)
            .try_init()
            .map_err(|_| LogError::AlreadyInstalled)?;

        tracing::info!(
            stdout = config.stdout,
            dir = ?dir,
            max_files = config.max_files,
            "logging started"
        );
        Ok(Self { dir, guard })
    }

    /// Directory receiving log files, if file logging is on.
    pub fn log_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Flush buffered lines and stop the file writer.
    ///
    /// Events logged afterwards still reach stdout but no longer the file.
    pub fn close(mut self) {
        tracing::info!("logging stopped");
        drop(self.guard.take());
    }
}

fn parse_filter(directives: &str) -> Result<EnvFilter, LogError> {
    EnvFilter::try_new(directives).map_err(|e| LogError::Filter {
        filter: directives.to_string(),
        reason: e.to_string(),
    })
}

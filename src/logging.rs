//! Log sink setup for the binaries.
//!
//! `OPENCODE_VIEW_LOG` holds an `EnvFilter` directive string.
//! `OPENCODE_VIEW_LOG_FILE` redirects output to a file, which keeps log lines
//! out of the terminal frames drawn by `opencode-view`. Without a file only
//! warnings reach stderr; with one the default is `info`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::env_string_opt;

pub const LOG_ENV: &str = "OPENCODE_VIEW_LOG";
pub const LOG_FILE_ENV: &str = "OPENCODE_VIEW_LOG_FILE";
pub const DEFAULT_LOG_FILTER: &str = "info";
/// Default when logs share the terminal with drawn frames.
pub const DEFAULT_STDERR_LOG_FILTER: &str = "warn";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("failed to open log file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install global subscriber: {0}")]
    Install(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub filter: String,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_STDERR_LOG_FILTER.to_string(),
            file: None,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        let file = env_string_opt(LOG_FILE_ENV).map(PathBuf::from);
        let fallback = if file.is_some() {
            DEFAULT_LOG_FILTER
        } else {
            DEFAULT_STDERR_LOG_FILTER
        };
        Self {
            filter: env_string_opt(LOG_ENV).unwrap_or_else(|| fallback.to_string()),
            file,
        }
    }
}

pub fn parse_filter(filter: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(filter).map_err(|source| LoggingError::InvalidFilter {
        filter: filter.to_string(),
        source,
    })
}

pub fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::OpenFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Install the process-wide subscriber. Call once, before any work starts.
pub fn init(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = parse_filter(&config.filter)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match &config.file {
        Some(path) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(open_log_file(path)?))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    installed.map_err(|error| LoggingError::Install(error.to_string()))
}

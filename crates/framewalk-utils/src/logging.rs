//! # Logging
//!
//! `tracing` subscriber setup for framewalk.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Filter directives (e.g. `debug`, `framewalk_core=trace`)
//! - `FRAMEWALK_LOG_FORMAT`: `pretty` (default) or `json`
//! - `FRAMEWALK_LOG_FILE`: Also write logs to this file. If it names a
//!   directory, a dated `YYYY-MM-DD-framewalk.log` is created inside it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use framewalk_utils::{LogFormat, LogLevel, init_logging_with_level};
//!
//! let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)
//!     .expect("Failed to initialize logging");
//! tracing::debug!("walking frames");
//! ```
//!
//! Keep the returned [`LoggingGuard`] alive for as long as logs should reach
//! the file; dropping it flushes the background writer.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const FORMAT_VAR: &str = "FRAMEWALK_LOG_FORMAT";
const FILE_VAR: &str = "FRAMEWALK_LOG_FILE";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat
{
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(format!("{s} (use 'pretty' or 'json')"))),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(format!(
                "{s} (use 'error', 'warn', 'info', 'debug' or 'trace')"
            ))),
        }
    }
}

/// Keeps the file writer alive; logs still buffered are flushed on drop.
#[derive(Debug, Default)]
pub struct LoggingGuard
{
    _file: Option<WorkerGuard>,
}

/// Where and how to log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig
{
    /// Explicit level. Takes precedence over `RUST_LOG`.
    pub level: Option<LogLevel>,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl LogConfig
{
    /// Configuration from `FRAMEWALK_LOG_FORMAT` and `FRAMEWALK_LOG_FILE`
    ///
    /// ## Errors
    ///
    /// Fails when `FRAMEWALK_LOG_FORMAT` holds an unknown format.
    pub fn from_env() -> Result<Self, LoggingError>
    {
        let format = match env::var(FORMAT_VAR) {
            Ok(value) => value.parse()?,
            Err(_) => LogFormat::default(),
        };
        Ok(Self {
            level: None,
            format,
            file: env::var_os(FILE_VAR).map(PathBuf::from),
        })
    }

    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self
    {
        self.level = Some(level);
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self
    {
        self.format = format;
        self
    }

    /// Filter built from the explicit level, else `RUST_LOG`, else `warn`.
    fn filter(&self) -> EnvFilter
    {
        match self.level {
            Some(level) => EnvFilter::new(Level::from(level).to_string()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::WARN.to_string())),
        }
    }

    /// Install the global subscriber
    ///
    /// ## Errors
    ///
    /// Fails if a subscriber is already installed or the log file cannot be
    /// created.
    pub fn init(&self) -> Result<LoggingGuard, LoggingError>
    {
        let mut layers = vec![console_layer(self.format, self.filter())];
        let mut guard = LoggingGuard::default();

        if let Some(file) = &self.file {
            let path = log_file_path(file);
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(directory)?;
            let file_name = path.file_name().unwrap_or_default();
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, worker) = tracing_appender::non_blocking(appender);
            guard._file = Some(worker);

            let layer = match self.format {
                LogFormat::Pretty => fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_filter(self.filter())
                    .boxed(),
                LogFormat::Json => fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_filter(self.filter())
                    .boxed(),
            };
            layers.push(layer);
        }

        Registry::default()
            .with(layers)
            .try_init()
            .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
        Ok(guard)
    }
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> Box<dyn Layer<Registry> + Send + Sync>
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_writer(io::stderr)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_writer(io::stderr)
            .with_filter(filter)
            .boxed(),
    }
}

/// `path` itself, or a dated file inside it when `path` is a directory.
fn log_file_path(path: &Path) -> PathBuf
{
    if path.is_dir() {
        path.join(format!("{}-framewalk.log", Utc::now().format("%Y-%m-%d")))
    } else {
        path.to_path_buf()
    }
}

/// Initialize logging from the environment
///
/// ## Errors
///
/// Returns an error if logging is already initialized, the environment holds
/// an invalid format, or the log file cannot be created.
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    LogConfig::from_env()?.init()
}

/// Initialize logging with an explicit level and format
///
/// `FRAMEWALK_LOG_FILE` is still honoured.
///
/// ## Errors
///
/// Returns an error if logging is already initialized or the log file cannot
/// be created.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    LogConfig {
        level: Some(level),
        format,
        file: env::var_os(FILE_VAR).map(PathBuf::from),
    }
    .init()
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// A global subscriber is already installed
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

//! # Logging Utilities
//!
//! Logging infrastructure for stepwise using `tracing`.
//!
//! This module provides structured logging with support for:
//! - Pretty (development) and JSON (machine-readable) output
//! - Environment variable configuration
//! - An optional daily-rolling log file next to console output
//! - File-only sessions, for when stdout belongs to the debuggee
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stepwise_utils::init_logging;
//!
//! // Reads RUST_LOG, STEPWISE_LOG_FORMAT and STEPWISE_LOG_FILE
//! let _guard = init_logging().expect("Failed to initialize logging");
//!
//! tracing::info!("Application started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Filter directives (e.g., `RUST_LOG=debug`, `RUST_LOG=stepwise_core::engine=trace`)
//! - `STEPWISE_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
//! - `STEPWISE_LOG_FILE`: Optional log file path; rotated daily
//!
//! ## Guards
//!
//! Every initializer returns a [`LoggingGuard`]. File output goes through a
//! non-blocking writer that flushes when the guard is dropped, so keep it
//! alive for the whole session.

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

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "STEPWISE_LOG_FORMAT";
/// Environment variable naming an additional log file.
pub const LOG_FILE_ENV: &str = "STEPWISE_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default)
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
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(format!("{s}. Use 'pretty' or 'json'"))),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    Info,
    /// Debug level
    Debug,
    /// Trace level; logs every ptrace request and wait status
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
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(format!(
                "{s}. Use 'error', 'warn', 'info', 'debug', or 'trace'"
            ))),
        }
    }
}

/// Keeps background log writers alive
///
/// Dropping the guard flushes and stops the file writer, if any.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug, Default)]
pub struct LoggingGuard
{
    file: Option<PathBuf>,
    _worker: Option<WorkerGuard>,
}

impl LoggingGuard
{
    /// Directory and file-name prefix of the log file, if one is written.
    ///
    /// The daily appender adds a date suffix to the prefix.
    #[must_use]
    pub fn file(&self) -> Option<&Path>
    {
        self.file.as_deref()
    }
}

/// Initialize logging with default settings
///
/// Reads configuration from environment variables:
/// - `RUST_LOG`: Filter directives (default: `info`)
/// - `STEPWISE_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
/// - `STEPWISE_LOG_FILE`: Optional path of a daily-rolling log file
///
/// ## Errors
///
/// Returns an error if:
/// - Logging is already initialized
/// - `STEPWISE_LOG_FORMAT` holds an unknown value
/// - The log file directory cannot be created
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    let format = match env::var(LOG_FORMAT_ENV) {
        Ok(value) => value.parse()?,
        Err(_) => LogFormat::Pretty,
    };
    init(format, None)
}

/// Initialize logging with explicit level and format
///
/// The level replaces `RUST_LOG`; `STEPWISE_LOG_FILE` is still honoured.
///
/// ## Example
///
/// ```rust,no_run
/// use stepwise_utils::{LogFormat, LogLevel, init_logging_with_level};
///
/// let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if logging is already initialized or file logging fails.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    init(format, Some(level.into()))
}

/// Initialize file-only logging
///
/// Nothing is written to stdout or stderr, which belong to the debuggee
/// while it runs in the foreground. `path` is the directory and file-name
/// prefix; the file rotates daily. When `path` is `None` the log goes to
/// [`default_log_file`].
///
/// ## Example
///
/// ```rust,no_run
/// use stepwise_utils::{LogFormat, LogLevel, init_logging_to_file};
///
/// let guard = init_logging_to_file(None, Some(LogLevel::Debug), LogFormat::Json)
///     .expect("Failed to initialize logging");
/// eprintln!("logging to {:?}", guard.file());
/// ```
///
/// ## Errors
///
/// Returns an error if logging is already initialized or the directory
/// cannot be created.
pub fn init_logging_to_file(
    path: Option<PathBuf>,
    level: Option<LogLevel>,
    format: LogFormat,
) -> Result<LoggingGuard, LoggingError>
{
    let path = path.unwrap_or_else(default_log_file);
    let filter = build_filter(level.map(Into::into));
    let (layer, worker) = file_layer(&path, format, filter)?;

    Registry::default()
        .with(layer)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;

    tracing::info!(started = %Utc::now().to_rfc3339(), file = %path.display(), "file logging initialized");
    Ok(LoggingGuard {
        file: Some(path),
        _worker: Some(worker),
    })
}

/// Default file-only log location
///
/// `~/.stepwise/stepwise.log`, or `/tmp/stepwise.log` when `HOME` is unset.
#[must_use]
pub fn default_log_file() -> PathBuf
{
    env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".stepwise"))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("stepwise.log")
}

/// Build the filter: an explicit level wins, then `RUST_LOG`, then `info`.
fn build_filter(explicit: Option<Level>) -> EnvFilter
{
    match explicit {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
    }
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer
{
    let layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(io::stderr);

    match format {
        LogFormat::Pretty => layer.with_ansi(true).with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

fn file_layer(path: &Path, format: LogFormat, filter: EnvFilter) -> Result<(BoxedLayer, WorkerGuard), LoggingError>
{
    let directory = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_name()
        .ok_or_else(|| LoggingError::InitializationFailed(format!("{} is not a file path", path.display())))?;
    std::fs::create_dir_all(directory)?;

    let appender = tracing_appender::rolling::daily(directory, prefix);
    let (writer, worker) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false);

    let layer = match format {
        LogFormat::Pretty => layer.with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    };
    Ok((layer, worker))
}

fn init(format: LogFormat, explicit: Option<Level>) -> Result<LoggingGuard, LoggingError>
{
    let log_file = env::var_os(LOG_FILE_ENV).map(PathBuf::from);
    let mut layers = vec![console_layer(format, build_filter(explicit))];

    let mut guard = LoggingGuard::default();
    if let Some(path) = log_file {
        let (layer, worker) = file_layer(&path, format, build_filter(explicit))?;
        layers.push(layer);
        guard = LoggingGuard {
            file: Some(path),
            _worker: Some(worker),
        };
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
    Ok(guard)
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

//! # Stepwise Utilities
//!
//! Shared helpers for the stepwise binaries.
//!
//! Today this is the logging setup built on `tracing`: console output in
//! pretty or JSON form, an optional daily-rolling file, and a file-only mode
//! for sessions where the terminal belongs to the debuggee.

pub mod logging;

pub use logging::{
    default_log_file, init_logging, init_logging_to_file, init_logging_with_level, LogFormat, LogLevel, LoggingError,
    LoggingGuard,
};

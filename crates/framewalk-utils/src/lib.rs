//! # framewalk Utilities
//!
//! Logging setup shared by the framewalk binaries, built on `tracing`.
//!
//! Diagnostics go to stderr (and optionally a file) so that walk output on
//! stdout stays machine-readable.

pub mod logging;

pub use logging::{init_logging, init_logging_with_level, LogConfig, LogFormat, LogLevel, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};

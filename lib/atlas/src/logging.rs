//! Process-wide logging facade. Re-exports the slog vocabulary used across the
//! workspace and builds the root drain from the runtime configuration.

use serde_derive::{Deserialize, Serialize};
use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

/// Verbosity threshold of the root logger. `Off` silences everything by
/// swapping in a discarding drain.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Off,
}

impl Level {
    #[inline]
    fn severity(self) -> Option<Severity> {
        match self {
            Level::Trace => Some(Severity::Trace),
            Level::Debug => Some(Severity::Debug),
            Level::Info => Some(Severity::Info),
            Level::Warn => Some(Severity::Warning),
            Level::Error => Some(Severity::Error),
            Level::Critical => Some(Severity::Critical),
            Level::Off => None,
        }
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Critical => "critical",
            Level::Off => "off",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(value: &str) -> Result<Level, String> {
        match value {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "critical" => Ok(Level::Critical),
            "off" => Ok(Level::Off),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Builds the root logger. With a directory the log goes to a rotated file
/// inside it, otherwise to stderr.
pub fn init(level: Level, log_dir: Option<&Path>) -> Result<Logger, sloggers::Error> {
    let severity = match level.severity() {
        Some(severity) => severity,
        None => return Ok(null()),
    };

    match log_dir {
        Some(dir) => {
            let mut builder = FileLoggerBuilder::new(dir.join("boneaged.log"));
            builder.level(severity);
            builder.rotate_size(64 * 1024 * 1024);
            builder.rotate_keep(4);
            builder.build()
        }
        None => {
            let mut builder = TerminalLoggerBuilder::new();
            builder.level(severity);
            builder.destination(Destination::Stderr);
            builder.build()
        }
    }
}

/// A logger that drops every record. Used by tests and by constructors that
/// accept an optional parent logger.
#[inline]
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}

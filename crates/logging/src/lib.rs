//! Logging setup shared by the node daemon, the CLI and tests.
//!
//! `RUST_LOG` always wins; the filter passed in is only the fallback.

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt as tracing_fmt, prelude::*, EnvFilter};

/// Filter used when neither `RUST_LOG` nor a level is given
pub const DEFAULT_FILTER: &str = "info,nexa=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Filter directive: the level for everything, one step more for nexa crates
    pub fn directive(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => DEFAULT_FILTER,
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn try_init(level: LogLevel) -> Result<(), TryInitError> {
    try_init_with_filter(level.directive())
}

pub fn try_init_with_filter(default_filter: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(tracing_fmt::layer())
        .with(env_filter(default_filter))
        .try_init()
}

/// Install the global subscriber, ignoring a second initialisation
pub fn init_logging(default_filter: &str) {
    if try_init_with_filter(default_filter).is_err() {
        tracing::debug!("Logging already initialised");
    }
}

//! Logging configuration.
//!
//! The client logs through `tracing` with structured fields; this module
//! wires up a subscriber with either pretty or JSON output.
//!
//! # Basic Logging
//!
//! ```rust,no_run
//! use kavka::telemetry::{init_logging, LogFormat};
//!
//! // Pretty logging for development
//! init_logging(LogFormat::Pretty).expect("failed to init logging");
//! ```
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: set to `json` or `pretty` (default: `pretty`)
//! - `RUST_LOG`: control log levels (default: `info`)

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

static LOG_INIT: OnceCell<LogFormat> = OnceCell::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty-print format (default).
    #[default]
    Pretty,
    /// JSON format for log aggregators.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        })
    }
}

impl LogFormat {
    /// Read from the `LOG_FORMAT` environment variable.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Initialize logging with the specified format.
///
/// Log levels are controlled via the `RUST_LOG` environment variable and
/// default to `info`. Calling this twice returns an error; the first
/// subscriber stays installed.
pub fn init_logging(format: LogFormat) -> Result<()> {
    LOG_INIT
        .set(format)
        .map_err(|_| Error::Config("logging already initialized".to_string()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| Error::Config(format!("failed to install subscriber: {e}")))
}

/// The format logging was initialized with, if it was.
pub fn active_format() -> Option<LogFormat> {
    LOG_INIT.get().copied()
}

//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::CoreError;

/// Install the global subscriber
///
/// `RUST_LOG` overrides the configured level.
///
/// # Errors
/// Returns `CoreError::Config` for an invalid level or if a subscriber is
/// already installed
pub fn init_tracing(config: &LoggingConfig) -> Result<(), CoreError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| CoreError::Config(format!("log level {}: {e}", config.level)))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Plain => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };

    result.map_err(|e| CoreError::Config(format!("tracing already initialised: {e}")))
}

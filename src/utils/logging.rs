//! # Logging
//!
//! Structured logging setup on top of `tracing-subscriber`.
//!
//! The filter comes from `RUST_LOG` when set and falls back to the level in
//! [`LoggingConfig`]. Installing twice is not an error: the second call is
//! ignored and reported as `Ok(false)`, which keeps tests that each initialize
//! logging independent of each other.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::Result;

/// Install the global subscriber described by `config`
///
/// Returns `Ok(true)` when a subscriber was installed by this call.
pub fn init(config: &LoggingConfig) -> Result<bool> {
    if !config.log_to_console {
        return Ok(false);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()));

    let installed = if config.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    };

    if installed {
        tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    }
    Ok(installed)
}

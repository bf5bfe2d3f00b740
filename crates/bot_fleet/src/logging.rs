//! Logging system setup and configuration
//!
//! Initializes the tracing-based process logging. This is separate from the
//! per-instance operator feed in [`crate::logs`], which mirrors every entry it
//! records into these logs.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSettings;

/// Initialize the logging system
///
/// Sets up structured logging using the tracing crate with the configured
/// level and output format.
///
/// # Arguments
/// * `settings` - Logging section of the fleet configuration
///
/// # Returns
/// * `Result<()>` - Error if a global subscriber is already installed
///
/// # Environment Variables
/// * `RUST_LOG` - Override the configured filter (e.g., "debug", "bot_fleet=trace")
pub fn setup_logging(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.level));

    if settings.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(false))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .try_init()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_setup_twice_does_not_panic() {
        let settings = LoggingSettings::default();

        // Only one global subscriber can exist; the second call reports it.
        let first = setup_logging(&settings);
        let second = setup_logging(&settings);
        assert!(first.is_ok() || second.is_err());
        assert!(second.is_err());
    }
}

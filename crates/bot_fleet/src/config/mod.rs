//! Configuration module for the bot fleet
//!
//! This module handles the fleet configuration file, the desired-state
//! instances file and change notification for the latter.

pub mod desired;
pub mod settings;
pub mod watcher;

pub use desired::{DesiredInstance, DesiredState, DesiredStateStore};
pub use settings::{FleetConfig, LogSettings, LoggingSettings, SessionSettings, StoreSettings};
pub use watcher::DesiredStateWatcher;

use crate::error::ConfigError;
use std::path::Path;
use tracing::{info, warn};

impl FleetConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at the
    /// specified path and returns the default configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The loaded or default configuration, or an error if loading/creation failed.
    pub async fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
            match toml::from_str::<FleetConfig>(&content) {
                Ok(config) => Ok(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    Err(ConfigError::Parse(path.to_path_buf(), e))
                }
            }
        } else {
            let default_config = FleetConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        let session = &self.session;
        if session.max_reconnect_attempts == 0 {
            return Err("max_reconnect_attempts must be at least 1".to_string());
        }
        if session.ping_attempts == 0 {
            return Err("ping_attempts must be at least 1".to_string());
        }

        let durations = [
            ("base_reconnect_delay_ms", session.base_reconnect_delay_ms),
            ("ping_timeout_ms", session.ping_timeout_ms),
            ("ping_retry_delay_ms", session.ping_retry_delay_ms),
            ("heartbeat_interval_ms", session.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", session.heartbeat_timeout_ms),
            ("connect_timeout_ms", session.connect_timeout_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }
        if session.heartbeat_timeout_ms < session.heartbeat_interval_ms {
            return Err(
                "heartbeat_timeout_ms must not be shorter than heartbeat_interval_ms".to_string(),
            );
        }

        if self.logs.buffer_capacity == 0 {
            return Err("Log buffer capacity must be greater than 0".to_string());
        }
        if self.logs.token_ttl_secs == 0 {
            return Err("Token TTL must be greater than 0".to_string());
        }

        if self.store.instances_file.as_os_str().is_empty() {
            return Err("Instances file path cannot be empty".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    /// Loads and validates in one step.
    pub async fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path).await?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }
}

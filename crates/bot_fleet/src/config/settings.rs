//! Configuration settings structures
//!
//! This module defines the fleet configuration file: session timing, log
//! feed limits, where the desired-state file lives, and process logging.
//! Every field carries a serde default so partial files parse.

use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
///
/// Root object of the fleet configuration file. It can be serialized to and
/// from TOML.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct FleetConfig {
    /// Connection session timing
    #[serde(default)]
    pub session: SessionSettings,
    /// Operator log feed settings
    #[serde(default)]
    pub logs: LogSettings,
    /// Desired-state store settings
    #[serde(default)]
    pub store: StoreSettings,
    /// Process logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Connection session settings
///
/// Durations are expressed in milliseconds.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Reconnects before the counter resets and a cooldown runs
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Base delay between reconnects
    ///
    /// Doubled while the server looks down and for the cooldown.
    #[serde(default = "default_base_reconnect_delay_ms")]
    pub base_reconnect_delay_ms: u64,

    /// Ping attempts per probe
    #[serde(default = "default_ping_attempts")]
    pub ping_attempts: u32,

    /// Timeout for a single ping
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Pause after a failed ping
    #[serde(default = "default_ping_retry_delay_ms")]
    pub ping_retry_delay_ms: u64,

    /// How often the liveness watchdog checks a joined connection
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence tolerated on a joined connection
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Time a new connection gets to join
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Operator log feed settings
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Entries kept per instance
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Lifetime of a log subscription token, in seconds
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

/// Desired-state store settings
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// TOML file listing the instances that should run
    #[serde(default = "default_instances_file")]
    pub instances_file: PathBuf,

    /// Root directory for per-instance credentials
    ///
    /// Each instance uses `<credentials_dir>/<instance id>`.
    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: PathBuf,

    /// Quiet period before a burst of file changes is reconciled
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Whether to watch the instances file for changes
    #[serde(default = "default_watch")]
    pub watch: bool,
}

/// Logging configuration settings
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_base_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_ping_attempts() -> u32 {
    3
}

fn default_ping_timeout_ms() -> u64 {
    10_000
}

fn default_ping_retry_delay_ms() -> u64 {
    2_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_token_ttl_secs() -> u64 {
    300
}

fn default_instances_file() -> PathBuf {
    PathBuf::from("instances.toml")
}

fn default_credentials_dir() -> PathBuf {
    PathBuf::from("profiles")
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_watch() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            base_reconnect_delay_ms: default_base_reconnect_delay_ms(),
            ping_attempts: default_ping_attempts(),
            ping_timeout_ms: default_ping_timeout_ms(),
            ping_retry_delay_ms: default_ping_retry_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            instances_file: default_instances_file(),
            credentials_dir: default_credentials_dir(),
            debounce_ms: default_debounce_ms(),
            watch: default_watch(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl SessionSettings {
    /// Converts the millisecond fields into a [`SessionConfig`].
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            max_reconnect_attempts: self.max_reconnect_attempts,
            base_reconnect_delay: Duration::from_millis(self.base_reconnect_delay_ms),
            ping_attempts: self.ping_attempts,
            ping_timeout: Duration::from_millis(self.ping_timeout_ms),
            ping_retry_delay: Duration::from_millis(self.ping_retry_delay_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

impl LogSettings {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

impl StoreSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

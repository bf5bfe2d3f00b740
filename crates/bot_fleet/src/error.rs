//! Error types for the fleet.
//!
//! Errors are split by who sees them. [`FleetError`] is returned to callers of
//! the control surface. [`SessionError`] describes connection-level failures
//! that a session handles on its own: they are logged and drive a reconnect,
//! they never propagate out of the session task. [`ProtocolError`] is what a
//! protocol client reports, and [`ConfigError`] covers configuration and
//! desired-state loading.

use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by a [`ProtocolClient`](crate::protocol::ProtocolClient)
/// or one of its handles.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Ping to {host}:{port} failed: {reason}")]
    Ping {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Connection closed")]
    Closed,
}

/// Connection-level failures. Always recoverable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Server did not answer {attempts} ping attempt(s)")]
    ProbeFailed { attempts: u32 },

    #[error("Failed to open connection: {0}")]
    ConnectFailed(ProtocolError),

    #[error("Connection did not join within the connect timeout")]
    ConnectTimeout,

    #[error("No liveness signal within the heartbeat deadline")]
    HeartbeatTimeout,
}

/// Errors returned by the control surface.
///
/// These are usage errors: they are reported to the caller and never change
/// the state of any instance.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FleetError {
    #[error("Instance {0} is already running")]
    AlreadyRunning(String),

    #[error("Instance {0} not found")]
    NotFound(String),

    #[error("Instance {0} is disabled")]
    Disabled(String),

    #[error("Instance {0} is not connected")]
    NotConnected(String),

    #[error("Invalid or expired token")]
    InvalidOrExpiredToken,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Configuration and desired-state loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Failed to parse {0}: {1}")]
    Parse(PathBuf, toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to watch {0}: {1}")]
    Watch(PathBuf, notify::Error),
}

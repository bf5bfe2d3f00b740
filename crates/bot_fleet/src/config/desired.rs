//! Desired-state description of the fleet.
//!
//! The instances file is a TOML document with one table per instance:
//!
//! ```toml
//! [instances.lobby]
//! host = "play.example.net"
//! port = 19132
//! username = "LobbyBot"
//! offline_mode = false
//! disabled = false
//! ```

use crate::error::ConfigError;
use crate::registry::InstanceConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One instance entry of the desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredInstance {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub offline_mode: bool,
    #[serde(default)]
    pub disabled: bool,
}

impl DesiredInstance {
    /// Connection target described by this entry.
    pub fn to_config(&self) -> InstanceConfig {
        InstanceConfig {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            offline_mode: self.offline_mode,
        }
    }
}

/// Which instances should exist, and whether each should run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub instances: BTreeMap<String, DesiredInstance>,
}

impl DesiredState {
    /// Parses and validates a desired-state document.
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let state: DesiredState = toml::from_str(content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        state.validate()?;
        Ok(state)
    }

    /// Rejects entries that could never connect.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (id, instance) in &self.instances {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid("Instance id cannot be empty".to_string()));
            }
            if instance.host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("Instance {id}: host cannot be empty")));
            }
            if instance.port == 0 {
                return Err(ConfigError::Invalid(format!("Instance {id}: port cannot be 0")));
            }
            if instance.username.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Instance {id}: username cannot be empty"
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&DesiredInstance> {
        self.instances.get(id)
    }

    /// Entries that should be running.
    pub fn enabled(&self) -> impl Iterator<Item = (&String, &DesiredInstance)> {
        self.instances.iter().filter(|(_, instance)| !instance.disabled)
    }

    /// Whether `id` is listed and not disabled.
    pub fn is_enabled(&self, id: &str) -> bool {
        self.instances
            .get(id)
            .map(|instance| !instance.disabled)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// File-backed desired-state source.
#[derive(Debug, Clone)]
pub struct DesiredStateStore {
    path: PathBuf,
}

impl DesiredStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the current desired state.
    ///
    /// A missing file is an empty fleet, not an error.
    pub async fn load(&self) -> Result<DesiredState, ConfigError> {
        if !self.path.exists() {
            debug!("Instances file {} not found, no instances desired", self.path.display());
            return Ok(DesiredState::default());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ConfigError::Io(self.path.clone(), e))?;
        let state = DesiredState::from_toml_str(&content, &self.path)?;
        info!(
            "📋 Loaded {} instance(s) from {}",
            state.len(),
            self.path.display()
        );
        Ok(state)
    }

    /// Writes `state` back to the file.
    pub async fn save(&self, state: &DesiredState) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(state)?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| ConfigError::Io(self.path.clone(), e))
    }
}

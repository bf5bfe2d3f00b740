//! Instance registry.
//!
//! Owns every known instance keyed by id. An instance outlives its session:
//! stopping drops the session but keeps the instance record, its log buffer
//! and its subscriber binding until the instance is removed.
//!
//! Shard locks on the instance map are only held for bookkeeping and never
//! across an `.await`, so sessions and callers never block each other.

use crate::error::FleetError;
use crate::logs::LogBroadcaster;
use crate::protocol::{ConnectParams, ProtocolClient};
use crate::session::{ConnectionSession, ConnectionState, SessionConfig};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Connection target of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub offline_mode: bool,
}

/// What `status` reports for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub connection_state: ConnectionState,
    pub is_server_down: bool,
    pub reconnect_attempts: u32,
    pub subscriber_attached: bool,
}

impl InstanceStatus {
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}

#[derive(Debug)]
struct Instance {
    config: InstanceConfig,
    /// Present from `start` until `stop`. A present session is always running.
    session: Option<Arc<ConnectionSession>>,
    /// Set from desired state. A disabled instance never holds a session.
    disabled: bool,
}

/// Registry of all managed instances.
pub struct InstanceRegistry {
    instances: DashMap<String, Instance>,
    client: Arc<dyn ProtocolClient>,
    logs: Arc<LogBroadcaster>,
    session_config: SessionConfig,
    credentials_root: PathBuf,
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.instances.len())
            .field("credentials_root", &self.credentials_root)
            .finish_non_exhaustive()
    }
}

impl InstanceRegistry {
    /// Creates an empty registry.
    ///
    /// # Arguments
    ///
    /// * `client` - Protocol client every session connects through
    /// * `logs` - Shared log broadcaster
    /// * `session_config` - Timing parameters applied to each new session
    /// * `credentials_root` - Directory under which each instance gets its own
    ///   credentials folder named after its id
    pub fn new(
        client: Arc<dyn ProtocolClient>,
        logs: Arc<LogBroadcaster>,
        session_config: SessionConfig,
        credentials_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            instances: DashMap::new(),
            client,
            logs,
            session_config,
            credentials_root: credentials_root.into(),
        }
    }

    pub fn logs(&self) -> &Arc<LogBroadcaster> {
        &self.logs
    }

    /// Starts a session for `id`, creating the instance if needed.
    ///
    /// # Errors
    ///
    /// [`FleetError::AlreadyRunning`] if the instance already has a session,
    /// [`FleetError::Disabled`] if desired state disables it.
    pub async fn start(&self, id: &str, config: InstanceConfig) -> Result<(), FleetError> {
        let session = {
            let mut instance = self
                .instances
                .entry(id.to_string())
                .or_insert_with(|| Instance {
                    config: config.clone(),
                    session: None,
                    disabled: false,
                });
            if instance.disabled {
                return Err(FleetError::Disabled(id.to_string()));
            }
            if instance.session.is_some() {
                return Err(FleetError::AlreadyRunning(id.to_string()));
            }

            let session = ConnectionSession::new(
                id,
                self.connect_params(id, &config),
                self.session_config.clone(),
                Arc::clone(&self.client),
                Arc::clone(&self.logs),
            );
            instance.config = config;
            instance.session = Some(Arc::clone(&session));
            session
        };

        self.logs.ensure(id);
        session.start().await;
        info!(instance = %id, "▶️ Instance started");
        Ok(())
    }

    /// Stops the session of `id`. Logs and subscriber stay in place.
    ///
    /// Stopping an instance that has no session is a no-op.
    ///
    /// # Errors
    ///
    /// [`FleetError::NotFound`] if the instance was never started.
    pub async fn stop(&self, id: &str) -> Result<(), FleetError> {
        let session = self
            .instances
            .get_mut(id)
            .ok_or_else(|| FleetError::NotFound(id.to_string()))?
            .session
            .take();

        if let Some(session) = session {
            session.stop().await;
            info!(instance = %id, "⏹️ Instance stopped");
        }
        Ok(())
    }

    /// Current status of `id`.
    ///
    /// # Errors
    ///
    /// [`FleetError::NotFound`] for unknown ids.
    pub fn status(&self, id: &str) -> Result<InstanceStatus, FleetError> {
        let session = self
            .instances
            .get(id)
            .ok_or_else(|| FleetError::NotFound(id.to_string()))?
            .session
            .clone();
        Ok(self.status_of(id, session.as_deref()))
    }

    /// Sends a chat message through the live session of `id`.
    ///
    /// # Errors
    ///
    /// [`FleetError::NotFound`] for unknown ids, [`FleetError::NotConnected`]
    /// if there is no joined session, or the handle's protocol error.
    pub async fn send_message(&self, id: &str, text: &str) -> Result<(), FleetError> {
        let session = self
            .instances
            .get(id)
            .ok_or_else(|| FleetError::NotFound(id.to_string()))?
            .session
            .clone()
            .ok_or_else(|| FleetError::NotConnected(id.to_string()))?;
        session.send_message(text).await
    }

    /// Stops `id` and forgets it entirely, log buffer and subscriber included.
    ///
    /// # Errors
    ///
    /// [`FleetError::NotFound`] for unknown ids.
    pub async fn remove(&self, id: &str) -> Result<(), FleetError> {
        let (_, instance) = self
            .instances
            .remove(id)
            .ok_or_else(|| FleetError::NotFound(id.to_string()))?;
        if let Some(session) = instance.session {
            session.stop().await;
        }
        self.logs.remove(id);
        info!(instance = %id, "🗑️ Instance removed");
        Ok(())
    }

    /// Records `config` for `id` without touching a live session.
    ///
    /// Creates the instance if it does not exist. Returns true if anything
    /// changed. A running session keeps its current target until restarted.
    pub fn record_config(&self, id: &str, config: InstanceConfig) -> bool {
        self.logs.ensure(id);
        let mut instance = self
            .instances
            .entry(id.to_string())
            .or_insert_with(|| Instance {
                config: config.clone(),
                session: None,
                disabled: false,
            });
        if instance.config == config {
            return false;
        }
        debug!(instance = %id, running = instance.session.is_some(), "Recorded new instance config");
        instance.config = config;
        true
    }

    /// Marks `id` as disabled or enabled. Returns false for unknown ids.
    ///
    /// Disabling does not stop a running session; callers stop it afterwards.
    /// Once disabled, `start` is rejected until the instance is enabled again.
    pub fn set_disabled(&self, id: &str, disabled: bool) -> bool {
        match self.instances.get_mut(id) {
            Some(mut instance) => {
                instance.disabled = disabled;
                true
            }
            None => false,
        }
    }

    pub fn is_disabled(&self, id: &str) -> bool {
        self.instances
            .get(id)
            .map(|instance| instance.disabled)
            .unwrap_or(false)
    }

    /// Config recorded for `id`.
    pub fn config(&self, id: &str) -> Option<InstanceConfig> {
        self.instances.get(id).map(|instance| instance.config.clone())
    }

    /// Target the live session of `id` is actually connected to.
    pub fn live_params(&self, id: &str) -> Option<ConnectParams> {
        self.instances
            .get(id)
            .and_then(|instance| instance.session.as_ref().map(|s| s.params().clone()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// Whether `id` currently has a session.
    pub fn is_running(&self, id: &str) -> bool {
        self.instances
            .get(id)
            .map(|instance| instance.session.is_some())
            .unwrap_or(false)
    }

    /// Ids of all instances with a session, sorted.
    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .instances
            .iter()
            .filter(|instance| instance.session.is_some())
            .map(|instance| instance.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every known instance with its status, sorted by id.
    pub fn list(&self) -> Vec<(String, InstanceStatus)> {
        let sessions: Vec<(String, Option<Arc<ConnectionSession>>)> = self
            .instances
            .iter()
            .map(|instance| (instance.key().clone(), instance.session.clone()))
            .collect();

        let mut statuses: Vec<(String, InstanceStatus)> = sessions
            .into_iter()
            .map(|(id, session)| {
                let status = self.status_of(&id, session.as_deref());
                (id, status)
            })
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Stops every running session concurrently.
    pub async fn stop_all(&self) {
        let sessions: Vec<Arc<ConnectionSession>> = self
            .instances
            .iter_mut()
            .filter_map(|mut instance| instance.session.take())
            .collect();
        if sessions.is_empty() {
            return;
        }

        info!("⏹️ Stopping {} session(s)", sessions.len());
        join_all(sessions.iter().map(|session| session.stop())).await;
    }

    fn status_of(&self, id: &str, session: Option<&ConnectionSession>) -> InstanceStatus {
        let subscriber_attached = self.logs.has_subscriber(id);
        match session {
            Some(session) => {
                let snapshot = session.snapshot();
                InstanceStatus {
                    connection_state: snapshot.state,
                    is_server_down: snapshot.is_server_down,
                    reconnect_attempts: snapshot.reconnect_attempts,
                    subscriber_attached,
                }
            }
            None => InstanceStatus {
                connection_state: ConnectionState::Idle,
                is_server_down: false,
                reconnect_attempts: 0,
                subscriber_attached,
            },
        }
    }

    fn connect_params(&self, id: &str, config: &InstanceConfig) -> ConnectParams {
        ConnectParams {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            offline_mode: config.offline_mode,
            credentials_dir: self.credentials_root.join(id),
        }
    }
}

//! Operator command surface.
//!
//! [`ControlApi`] is what an HTTP or WebSocket front end calls into. The
//! transport itself stays outside this crate; [`ControlCommand`] and
//! [`ControlResponse`] give it a ready-made JSON shape.

use crate::error::FleetError;
use crate::logs::LogFeedMessage;
use crate::registry::{InstanceConfig, InstanceRegistry, InstanceStatus};
use crate::tokens::TokenIssuer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Commands accepted by [`ControlApi::execute`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    Start {
        id: String,
        host: String,
        port: u16,
        username: String,
        #[serde(default)]
        offline_mode: bool,
    },
    Stop {
        id: String,
    },
    Chat {
        id: String,
        text: String,
    },
    Status {
        id: String,
    },
    IssueLogToken {
        id: String,
    },
    List,
}

/// Replies produced by [`ControlApi::execute`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Status { id: String, status: InstanceStatus },
    Token { id: String, token: String },
    Instances { instances: Vec<InstanceSummary> },
    Error { message: String },
}

/// One row of a `list` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: String,
    pub status: InstanceStatus,
}

/// An attached log subscription.
#[derive(Debug)]
pub struct LogFeed {
    pub instance_id: String,
    receiver: mpsc::UnboundedReceiver<LogFeedMessage>,
}

impl LogFeed {
    /// Next feed message; `None` once another subscriber replaced this one
    /// or the instance was removed.
    pub async fn recv(&mut self) -> Option<LogFeedMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LogFeedMessage> {
        self.receiver.try_recv().ok()
    }
}

/// Entry point for operator commands.
#[derive(Debug, Clone)]
pub struct ControlApi {
    registry: Arc<InstanceRegistry>,
    tokens: Arc<TokenIssuer>,
}

impl ControlApi {
    pub fn new(registry: Arc<InstanceRegistry>, tokens: Arc<TokenIssuer>) -> Self {
        Self { registry, tokens }
    }

    /// `START`: creates the instance if needed and starts its session.
    pub async fn start(&self, id: &str, config: InstanceConfig) -> Result<(), FleetError> {
        self.registry.start(id, config).await
    }

    /// `STOP`
    pub async fn stop(&self, id: &str) -> Result<(), FleetError> {
        self.registry.stop(id).await
    }

    /// `CHAT`: sends `text` as the instance's user.
    pub async fn chat(&self, id: &str, text: &str) -> Result<(), FleetError> {
        self.registry.send_message(id, text).await
    }

    /// `STATUS`
    pub fn status(&self, id: &str) -> Result<InstanceStatus, FleetError> {
        self.registry.status(id)
    }

    /// Every known instance with its status.
    pub fn list(&self) -> Vec<InstanceSummary> {
        self.registry
            .list()
            .into_iter()
            .map(|(id, status)| InstanceSummary { id, status })
            .collect()
    }

    /// Stops an instance and discards its logs and outstanding log tokens.
    pub async fn remove(&self, id: &str) -> Result<(), FleetError> {
        self.registry.remove(id).await?;
        self.tokens.revoke_instance(id);
        Ok(())
    }

    /// `ISSUE_LOG_TOKEN`: mints a one-time token for attaching to `id`'s feed.
    ///
    /// # Errors
    ///
    /// [`FleetError::NotFound`] for unknown instances.
    pub fn issue_log_token(&self, id: &str) -> Result<String, FleetError> {
        if !self.registry.contains(id) {
            return Err(FleetError::NotFound(id.to_string()));
        }
        Ok(self.tokens.issue(id))
    }

    /// Redeems `token` and attaches a new subscriber to its instance's feed.
    ///
    /// The feed yields `connected`, then `history`, then live entries. Any
    /// previous subscriber of the instance is detached.
    ///
    /// # Errors
    ///
    /// [`FleetError::InvalidOrExpiredToken`] if the token is unknown, used or
    /// expired, or its instance has since been removed; the transport should
    /// close the socket as unauthorized.
    pub fn open_log_feed(&self, token: &str) -> Result<LogFeed, FleetError> {
        let instance_id = self.tokens.redeem(token)?;
        if !self.registry.contains(&instance_id) {
            return Err(FleetError::InvalidOrExpiredToken);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.registry.logs().attach(&instance_id, tx) {
            return Err(FleetError::InvalidOrExpiredToken);
        }
        info!(instance = %instance_id, "📜 Log feed opened");
        Ok(LogFeed {
            instance_id,
            receiver: rx,
        })
    }

    /// Runs a decoded command and folds errors into the response.
    pub async fn execute(&self, command: ControlCommand) -> ControlResponse {
        let result = match command {
            ControlCommand::Start {
                id,
                host,
                port,
                username,
                offline_mode,
            } => {
                let config = InstanceConfig {
                    host,
                    port,
                    username,
                    offline_mode,
                };
                self.start(&id, config).await.map(|_| ControlResponse::Ok)
            }
            ControlCommand::Stop { id } => self.stop(&id).await.map(|_| ControlResponse::Ok),
            ControlCommand::Chat { id, text } => {
                self.chat(&id, &text).await.map(|_| ControlResponse::Ok)
            }
            ControlCommand::Status { id } => self
                .status(&id)
                .map(|status| ControlResponse::Status { id, status }),
            ControlCommand::IssueLogToken { id } => self
                .issue_log_token(&id)
                .map(|token| ControlResponse::Token { id, token }),
            ControlCommand::List => Ok(ControlResponse::Instances {
                instances: self.list(),
            }),
        };

        result.unwrap_or_else(|e| ControlResponse::Error {
            message: e.to_string(),
        })
    }
}

//! Contract with the external game protocol client.
//!
//! The fleet never speaks the game protocol itself. It drives a
//! [`ProtocolClient`] that can probe a server, open a connection and report
//! what happens on it. Everything the client observes on a connection arrives
//! as a [`ClientEvent`] on the receiver returned from
//! [`ProtocolClient::connect`], so no event can be emitted before the session
//! is listening.

use crate::error::ProtocolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Parameters for opening a connection to a game server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub offline_mode: bool,
    /// Directory holding cached credentials for this identity.
    pub credentials_dir: PathBuf,
}

/// Notifications raised by a live protocol handle.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The server accepted the session.
    Joined,
    /// The player entity spawned in the world.
    Spawned,
    /// A chat or system text message.
    TextReceived(TextPacket),
    /// Any other inbound packet.
    PacketReceived(Packet),
    /// The server sent a disconnect with a reason.
    Disconnected { reason: String },
    /// The underlying transport closed.
    Closed,
    /// The client hit an error.
    Errored(String),
}

impl ClientEvent {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Joined => "joined",
            ClientEvent::Spawned => "spawned",
            ClientEvent::TextReceived(_) => "text",
            ClientEvent::PacketReceived(_) => "packet",
            ClientEvent::Disconnected { .. } => "disconnected",
            ClientEvent::Closed => "closed",
            ClientEvent::Errored(_) => "errored",
        }
    }
}

/// Inbound text message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPacket {
    #[serde(rename = "type")]
    pub text_type: String,
    #[serde(default)]
    pub source_name: String,
    pub message: String,
    #[serde(default)]
    pub parameters: Vec<String>,
}

impl TextPacket {
    /// Plain chat message from a player.
    pub fn chat(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            text_type: "chat".to_string(),
            source_name: source_name.into(),
            message: message.into(),
            parameters: Vec::new(),
        }
    }

    /// Renders the packet as a single log line.
    ///
    /// Chat is shown as `<source> message`. Every other kind is shown raw;
    /// translation and formatting are left to whoever reads the feed.
    pub fn render(&self) -> String {
        if self.text_type == "chat" {
            format!("<{}> {}", self.source_name, self.message)
        } else {
            self.message.clone()
        }
    }
}

/// Opaque inbound packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Outbound packet queued on a handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl OutboundMessage {
    /// A chat `text` packet sent as `username`.
    pub fn chat(username: &str, text: &str) -> Self {
        Self {
            kind: "text".to_string(),
            payload: serde_json::json!({
                "type": "chat",
                "needs_translation": false,
                "source_name": username,
                "message": text,
                "filtered_message": "",
                "xuid": "",
                "platform_chat_id": "",
            }),
        }
    }
}

/// A freshly opened connection: the handle plus its event stream.
pub struct Connection {
    pub handle: Arc<dyn ProtocolHandle>,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Capability that performs the actual game protocol work.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Checks that a server is answering. Must give up after `timeout`.
    async fn ping(&self, host: &str, port: u16, timeout: Duration) -> Result<(), ProtocolError>;

    /// Opens a new connection and starts the handshake.
    ///
    /// Success means the handle exists; the session is only established once
    /// [`ClientEvent::Joined`] arrives on the returned event stream.
    async fn connect(&self, params: &ConnectParams) -> Result<Connection, ProtocolError>;
}

/// A single live connection owned by one session.
#[async_trait]
pub trait ProtocolHandle: Send + Sync {
    /// Queues an outbound packet.
    async fn send(&self, message: OutboundMessage) -> Result<(), ProtocolError>;

    /// Closes the connection. Pending operations on the handle fail afterwards.
    async fn close(&self);
}

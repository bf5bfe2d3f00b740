//! Pure connection lifecycle state machine.
//!
//! [`SessionMachine::handle`] maps `(state, input)` to a new state plus a list
//! of [`Effect`]s for the driver to carry out. Nothing in here touches the
//! network or the clock, which keeps every transition unit-testable.

use super::config::SessionConfig;
use crate::error::SessionError;
use crate::protocol::ClientEvent;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Disconnect reason the server sends when it briefly sees a stale copy of
/// our own session. The real session settles right after, so these are
/// dropped instead of triggering a reconnect.
pub const DUPLICATE_SESSION_MARKER: &str = "serverIdConflict";

/// Returns true when a disconnect reason is the duplicate-session conflict.
pub fn is_duplicate_session_conflict(reason: &str) -> bool {
    reason.contains(DUPLICATE_SESSION_MARKER)
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Probing,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// States in which a `start` request is a no-op.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Probing | ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::Probing => 1,
            ConnectionState::Connecting => 2,
            ConnectionState::Connected => 3,
            ConnectionState::Reconnecting => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Probing,
            2 => ConnectionState::Connecting,
            3 => ConnectionState::Connected,
            4 => ConnectionState::Reconnecting,
            _ => ConnectionState::Idle,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Probing => "probing",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Everything that can happen to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Start,
    Stop,
    ProbeSucceeded,
    ProbeFailed(SessionError),
    ConnectOpened,
    ConnectFailed(SessionError),
    Client(ClientEvent),
    HeartbeatExpired,
    BackoffElapsed,
}

/// Work the driver must perform after a transition, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Append a line to the instance log.
    Log(String),
    /// Run the ping probe.
    Probe,
    /// Discard any previous handle and open a fresh one.
    OpenConnection,
    /// Close and drop the current handle, if any.
    CloseConnection,
    /// Restart the liveness deadline.
    ArmWatchdog,
    /// Wait, then feed [`Input::BackoffElapsed`].
    ScheduleRetry(Duration),
    /// The session is finished; the driver exits.
    Exit,
}

/// Point-in-time view of a session's observable flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub is_server_down: bool,
}

impl SessionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Probing | ConnectionState::Connecting
        )
    }
}

/// The state machine proper.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: ConnectionState,
    reconnect_attempts: u32,
    is_server_down: bool,
    stopped: bool,
    max_reconnect_attempts: u32,
    base_reconnect_delay: Duration,
}

impl SessionMachine {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state: ConnectionState::Idle,
            reconnect_attempts: 0,
            is_server_down: false,
            stopped: false,
            max_reconnect_attempts: config.max_reconnect_attempts,
            base_reconnect_delay: config.base_reconnect_delay,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn is_server_down(&self) -> bool {
        self.is_server_down
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            is_server_down: self.is_server_down,
        }
    }

    /// Applies one input and returns the effects to run.
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        if let Input::Stop = input {
            return self.stop();
        }
        if self.stopped {
            return Vec::new();
        }

        match (self.state, input) {
            (ConnectionState::Idle, Input::Start) => {
                self.state = ConnectionState::Probing;
                vec![Effect::Log("Starting session".to_string()), Effect::Probe]
            }

            (ConnectionState::Probing, Input::ProbeSucceeded) => {
                self.state = ConnectionState::Connecting;
                vec![Effect::OpenConnection]
            }
            (ConnectionState::Probing, Input::ProbeFailed(err)) => {
                self.is_server_down = true;
                let mut effects = vec![Effect::Log(format!("Connection error: {err}"))];
                effects.extend(self.enter_reconnecting());
                effects
            }

            (ConnectionState::Connecting, Input::ConnectOpened) => {
                vec![Effect::Log("Connection opened, waiting to join".to_string())]
            }
            (ConnectionState::Connecting, Input::ConnectFailed(err)) => {
                self.is_server_down = true;
                let mut effects = vec![
                    Effect::Log(format!("Connection error: {err}")),
                    Effect::CloseConnection,
                ];
                effects.extend(self.enter_reconnecting());
                effects
            }

            (ConnectionState::Connecting | ConnectionState::Connected, Input::Client(event)) => {
                self.on_client_event(event)
            }

            (ConnectionState::Connected, Input::HeartbeatExpired) => {
                let mut effects = vec![
                    Effect::Log(format!("{}, reconnecting", SessionError::HeartbeatTimeout)),
                    Effect::CloseConnection,
                ];
                effects.extend(self.enter_reconnecting());
                effects
            }

            (ConnectionState::Reconnecting, Input::BackoffElapsed) => {
                self.state = ConnectionState::Probing;
                vec![Effect::Probe]
            }

            // Late or duplicate inputs: reentrant starts, timers that raced a
            // transition, events from a handle that is already gone.
            _ => Vec::new(),
        }
    }

    fn on_client_event(&mut self, event: ClientEvent) -> Vec<Effect> {
        match event {
            ClientEvent::Joined => {
                if self.state == ConnectionState::Connected {
                    return Vec::new();
                }
                let previous_attempts = self.reconnect_attempts;
                self.state = ConnectionState::Connected;
                self.reconnect_attempts = 0;
                self.is_server_down = false;
                vec![
                    Effect::Log(format!(
                        "Joined the server after {previous_attempts} reconnect attempt(s)"
                    )),
                    Effect::ArmWatchdog,
                ]
            }
            ClientEvent::Spawned => vec![Effect::Log("Spawned in the world".to_string())],
            ClientEvent::TextReceived(packet) => vec![Effect::Log(packet.render())],
            ClientEvent::PacketReceived(_) => Vec::new(),
            ClientEvent::Disconnected { reason } if is_duplicate_session_conflict(&reason) => {
                vec![Effect::Log(format!(
                    "Ignoring duplicate-session disconnect: {reason}"
                ))]
            }
            ClientEvent::Disconnected { reason } => {
                self.connection_lost(format!("Disconnected: {reason}"))
            }
            ClientEvent::Closed => self.connection_lost("Connection closed".to_string()),
            ClientEvent::Errored(err) => {
                self.is_server_down = true;
                self.connection_lost(format!("Error: {err}"))
            }
        }
    }

    fn connection_lost(&mut self, message: String) -> Vec<Effect> {
        let mut effects = vec![Effect::Log(message), Effect::CloseConnection];
        effects.extend(self.enter_reconnecting());
        effects
    }

    /// Counts the attempt and picks the delay.
    ///
    /// Going past `max_reconnect_attempts` resets the counter and waits out a
    /// doubled cooldown instead. There is no terminal failure state.
    fn enter_reconnecting(&mut self) -> Vec<Effect> {
        self.state = ConnectionState::Reconnecting;

        let next = self.reconnect_attempts + 1;
        if next > self.max_reconnect_attempts {
            self.reconnect_attempts = 0;
            let cooldown = self.base_reconnect_delay * 2;
            return vec![
                Effect::Log(format!(
                    "Max reconnection attempts reached, cooling down for {:.1}s",
                    cooldown.as_secs_f64()
                )),
                Effect::ScheduleRetry(cooldown),
            ];
        }

        self.reconnect_attempts = next;
        let delay = if self.is_server_down {
            self.base_reconnect_delay * 2
        } else {
            self.base_reconnect_delay
        };
        vec![
            Effect::Log(format!(
                "Attempting to reconnect ({}/{}) in {:.1}s",
                next,
                self.max_reconnect_attempts,
                delay.as_secs_f64()
            )),
            Effect::ScheduleRetry(delay),
        ]
    }

    fn stop(&mut self) -> Vec<Effect> {
        let was_running = !self.stopped && self.state != ConnectionState::Idle;
        self.stopped = true;
        self.state = ConnectionState::Idle;

        let mut effects = vec![Effect::CloseConnection];
        if was_running {
            effects.push(Effect::Log("Session stopped".to_string()));
        }
        effects.push(Effect::Exit);
        effects
    }
}

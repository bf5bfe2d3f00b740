//! # Bot Fleet
//!
//! Runs and supervises a fleet of headless game clients ("bots"), each one an
//! independently configured connection to a game server.
//!
//! ## Architecture Overview
//!
//! * **ConnectionSession** - Per-instance state machine: ping probe, connect,
//!   liveness watchdog, backoff-driven reconnection and teardown
//! * **InstanceRegistry** - All known instances keyed by id
//! * **ConfigReconciler** - Starts and stops instances to match the desired
//!   state file
//! * **LogBroadcaster** - Bounded per-instance log buffers with at most one
//!   live subscriber each
//! * **TokenIssuer** - Short-lived, single-use tokens for attaching to a feed
//! * **ControlApi** - Operator commands: start, stop, chat, status, log tokens
//!
//! ### Data Flow
//!
//! 1. The reconciler reads the desired state and drives the registry
//! 2. The registry owns one session per running instance
//! 3. Sessions drive the [`ProtocolClient`] and react to its events
//! 4. Everything a session observes lands in the instance's log feed
//!
//! The game protocol itself is not implemented here: callers supply a
//! [`ProtocolClient`].
//!
//! ## Error Handling
//!
//! Connection failures never escape a session. They are logged and drive a
//! reconnect, and surface only as session state. Operator mistakes come back
//! as [`FleetError`].

pub use config::{DesiredInstance, DesiredState, DesiredStateStore, FleetConfig};
pub use control::{ControlApi, ControlCommand, ControlResponse, InstanceSummary, LogFeed};
pub use error::{ConfigError, FleetError, ProtocolError, SessionError};
pub use fleet::{create_fleet, create_fleet_with_config, Fleet};
pub use logging::setup_logging;
pub use logs::{LogBroadcaster, LogEntry, LogFeedMessage};
pub use protocol::{
    ClientEvent, ConnectParams, Connection, OutboundMessage, Packet, ProtocolClient,
    ProtocolHandle, TextPacket,
};
pub use reconciler::{ConfigReconciler, ReconcileReport};
pub use registry::{InstanceConfig, InstanceRegistry, InstanceStatus};
pub use session::{ConnectionSession, ConnectionState, SessionConfig, SessionSnapshot};
pub use tokens::TokenIssuer;

pub mod config;
pub mod control;
pub mod error;
pub mod fleet;
pub mod logging;
pub mod logs;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod tokens;

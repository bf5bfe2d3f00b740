//! Tunables for a connection session.

use std::time::Duration;

/// Timing and retry parameters shared by every session.
///
/// One parameterised session replaces the family of hand-tuned reconnect
/// loops: everything that used to differ between them lives here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Consecutive reconnects before the counter resets and a cooldown runs.
    pub max_reconnect_attempts: u32,

    /// Base delay between reconnects. Doubled while the server looks down
    /// and for the cooldown after `max_reconnect_attempts`.
    pub base_reconnect_delay: Duration,

    /// Ping attempts per probe.
    pub ping_attempts: u32,

    /// Timeout applied to each individual ping.
    pub ping_timeout: Duration,

    /// Pause after a failed ping before the next one.
    pub ping_retry_delay: Duration,

    /// How often the watchdog checks for liveness.
    pub heartbeat_interval: Duration,

    /// Silence allowed on a joined connection before it is considered dead.
    pub heartbeat_timeout: Duration,

    /// Time a new handle gets to report `joined`.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            base_reconnect_delay: Duration::from_secs(5),
            ping_attempts: 3,
            ping_timeout: Duration::from_secs(10),
            ping_retry_delay: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(20),
        }
    }
}

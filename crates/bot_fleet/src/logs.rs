//! Per-instance operator log feed.
//!
//! Every instance owns a bounded buffer of [`LogEntry`] records and at most one
//! live subscriber. Appending pushes to the buffer and forwards the entry to
//! the subscriber; attaching a new subscriber replaces the old one and replays
//! the buffer exactly once before live entries flow.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Default number of entries kept per instance.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// One immutable log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
    pub message: String,
}

/// Messages pushed to a log subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogFeedMessage {
    /// Attach acknowledged.
    Connected { instance_id: String },
    /// Buffer contents at the moment of attach, oldest first.
    History { entries: Vec<LogEntry> },
    /// A live entry.
    Log { entry: LogEntry },
}

/// Sending half of a subscriber's feed.
pub type LogSubscriber = mpsc::UnboundedSender<LogFeedMessage>;

#[derive(Debug, Default)]
struct InstanceLog {
    entries: VecDeque<LogEntry>,
    subscriber: Option<LogSubscriber>,
}

/// Fans log entries out to per-instance buffers and subscribers.
#[derive(Debug)]
pub struct LogBroadcaster {
    logs: DashMap<String, InstanceLog>,
    capacity: usize,
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl LogBroadcaster {
    /// Creates a broadcaster keeping at most `capacity` entries per instance.
    pub fn new(capacity: usize) -> Self {
        Self {
            logs: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Makes sure a buffer exists for `instance_id`.
    pub fn ensure(&self, instance_id: &str) {
        self.logs.entry(instance_id.to_string()).or_default();
    }

    /// Records a message and forwards it to the live subscriber, if any.
    ///
    /// A subscriber whose receiver is gone is detached silently; buffering is
    /// unaffected.
    pub fn append(&self, instance_id: &str, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry {
            timestamp: Utc::now(),
            instance_id: instance_id.to_string(),
            message: message.into(),
        };
        info!(instance = %instance_id, "{}", entry.message);

        let mut log = self.logs.entry(instance_id.to_string()).or_default();
        if log.entries.len() >= self.capacity {
            log.entries.pop_front();
        }
        log.entries.push_back(entry.clone());

        let delivered = log.subscriber.as_ref().map(|subscriber| {
            subscriber
                .send(LogFeedMessage::Log {
                    entry: entry.clone(),
                })
                .is_ok()
        });
        if delivered == Some(false) {
            log.subscriber = None;
            debug!(instance = %instance_id, "Log subscriber went away, detached");
        }

        entry
    }

    /// Binds `subscriber` as the only live subscriber of `instance_id`.
    ///
    /// Any previous subscriber is dropped, which ends its feed. The new one
    /// receives `connected`, then `history`, then live entries. Both initial
    /// messages are sent while the buffer is locked, so no live entry can
    /// overtake the history. Returns false if the instance has no buffer or
    /// the subscriber was already gone.
    pub fn attach(&self, instance_id: &str, subscriber: LogSubscriber) -> bool {
        let Some(mut log) = self.logs.get_mut(instance_id) else {
            debug!(instance = %instance_id, "Attach refused, no log buffer");
            return false;
        };
        let replaced = log.subscriber.take().is_some();

        let history = log.entries.iter().cloned().collect();
        let delivered = subscriber
            .send(LogFeedMessage::Connected {
                instance_id: instance_id.to_string(),
            })
            .is_ok()
            && subscriber
                .send(LogFeedMessage::History { entries: history })
                .is_ok();

        if delivered {
            log.subscriber = Some(subscriber);
            info!(instance = %instance_id, replaced, "🔗 Log subscriber attached");
        }
        delivered
    }

    /// Drops the live subscriber of `instance_id`.
    pub fn detach(&self, instance_id: &str) {
        if let Some(mut log) = self.logs.get_mut(instance_id) {
            if log.subscriber.take().is_some() {
                info!(instance = %instance_id, "Log subscriber detached");
            }
        }
    }

    /// Whether a subscriber is currently bound.
    ///
    /// A subscriber whose receiver was dropped counts as detached even if no
    /// entry has been appended since.
    pub fn has_subscriber(&self, instance_id: &str) -> bool {
        self.logs
            .get(instance_id)
            .and_then(|log| log.subscriber.as_ref().map(|s| !s.is_closed()))
            .unwrap_or(false)
    }

    /// Snapshot of the buffer, oldest first.
    pub fn entries(&self, instance_id: &str) -> Vec<LogEntry> {
        self.logs
            .get(instance_id)
            .map(|log| log.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, instance_id: &str) -> usize {
        self.logs
            .get(instance_id)
            .map(|log| log.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, instance_id: &str) -> bool {
        self.len(instance_id) == 0
    }

    /// Drops the buffer and subscriber of `instance_id`.
    pub fn remove(&self, instance_id: &str) -> bool {
        self.logs.remove(instance_id).is_some()
    }
}

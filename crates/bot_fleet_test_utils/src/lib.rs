//! Test support for `bot_fleet`.
//!
//! [`MockProtocolClient`] is an in-memory [`ProtocolClient`] with scripted
//! ping and connect outcomes. Every connection it opens is recorded as a
//! [`MockConnection`], through which a test can inject client events and
//! inspect what the session sent or whether it closed the handle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use bot_fleet::{
    ClientEvent, ConnectParams, Connection, OutboundMessage, ProtocolClient, ProtocolError,
    ProtocolHandle, TextPacket,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle side of a mock connection.
#[derive(Debug, Default)]
pub struct MockHandle {
    sent: Mutex<Vec<OutboundMessage>>,
    closed: AtomicBool,
}

#[async_trait]
impl ProtocolHandle for MockHandle {
    async fn send(&self, message: OutboundMessage) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }
        lock(&self.sent).push(message);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One connection opened by [`MockProtocolClient`].
#[derive(Debug, Clone)]
pub struct MockConnection {
    pub params: ConnectParams,
    events: mpsc::UnboundedSender<ClientEvent>,
    handle: Arc<MockHandle>,
}

impl MockConnection {
    /// Injects an event. Returns false if the session stopped listening.
    pub fn emit(&self, event: ClientEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn join(&self) -> bool {
        self.emit(ClientEvent::Joined)
    }

    pub fn disconnect(&self, reason: &str) -> bool {
        self.emit(ClientEvent::Disconnected {
            reason: reason.to_string(),
        })
    }

    pub fn chat(&self, source: &str, message: &str) -> bool {
        self.emit(ClientEvent::TextReceived(TextPacket::chat(source, message)))
    }

    /// Messages sent through this connection's handle.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        lock(&self.handle.sent).clone()
    }

    /// Whether the session closed this handle.
    pub fn is_closed(&self) -> bool {
        self.handle.closed.load(Ordering::SeqCst)
    }

    /// Whether the session dropped this connection's event stream.
    pub fn is_abandoned(&self) -> bool {
        self.events.is_closed()
    }
}

/// Scripted in-memory protocol client.
#[derive(Debug)]
pub struct MockProtocolClient {
    reachable: AtomicBool,
    ping_script: Mutex<VecDeque<Result<(), ProtocolError>>>,
    connect_script: Mutex<VecDeque<ProtocolError>>,
    connect_delay: Mutex<Option<Duration>>,
    pings: AtomicUsize,
    connects: AtomicUsize,
    connections: Mutex<Vec<MockConnection>>,
    connected: Notify,
}

impl Default for MockProtocolClient {
    fn default() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            ping_script: Mutex::new(VecDeque::new()),
            connect_script: Mutex::new(VecDeque::new()),
            connect_delay: Mutex::new(None),
            pings: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
            connected: Notify::new(),
        }
    }
}

impl MockProtocolClient {
    /// A client whose server answers pings and accepts connections.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A client whose server never answers pings.
    pub fn unreachable() -> Arc<Self> {
        let client = Self::default();
        client.reachable.store(false, Ordering::SeqCst);
        Arc::new(client)
    }

    /// Default ping outcome once the script is exhausted.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Queues ping outcomes consumed before falling back to the default.
    pub fn script_pings(&self, results: impl IntoIterator<Item = Result<(), ProtocolError>>) {
        lock(&self.ping_script).extend(results);
    }

    /// Makes the next connect attempt fail with `error`.
    pub fn fail_next_connect(&self, error: ProtocolError) {
        lock(&self.connect_script).push_back(error);
    }

    /// Delays every connect attempt by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.connect_delay) = Some(delay);
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Connect attempts, failed ones included.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connections that were successfully opened, oldest first.
    pub fn connections(&self) -> Vec<MockConnection> {
        lock(&self.connections).clone()
    }

    pub fn last_connection(&self) -> Option<MockConnection> {
        lock(&self.connections).last().cloned()
    }

    /// Waits until at least `count` connections have been opened and returns
    /// the `count`-th one. A `count` of zero waits for the first.
    pub async fn wait_for_connections(&self, count: usize) -> MockConnection {
        let count = count.max(1);
        loop {
            let notified = self.connected.notified();
            {
                let connections = lock(&self.connections);
                if connections.len() >= count {
                    return connections[count - 1].clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ProtocolClient for MockProtocolClient {
    async fn ping(&self, host: &str, port: u16, _timeout: Duration) -> Result<(), ProtocolError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = lock(&self.ping_script).pop_front() {
            return result;
        }
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::Ping {
                host: host.to_string(),
                port,
                reason: "no response".to_string(),
            })
        }
    }

    async fn connect(&self, params: &ConnectParams) -> Result<Connection, ProtocolError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.connect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = lock(&self.connect_script).pop_front() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(MockHandle::default());
        lock(&self.connections).push(MockConnection {
            params: params.clone(),
            events: tx,
            handle: Arc::clone(&handle),
        });
        self.connected.notify_waiters();

        Ok(Connection { handle, events: rx })
    }
}

/// Polls `condition` every 10ms of (possibly paused) time until it holds or
/// `limit` elapses. Returns the final outcome.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

//! Connection session: one instance's connect/heartbeat/reconnect loop.
//!
//! A [`ConnectionSession`] owns a single background task. The task holds the
//! [`SessionMachine`], feeds it inputs (probe results, handle events, timer
//! expiries, the stop signal) and carries out the effects it returns. Because
//! the watchdog, the connect timeout and the event stream are all polled by
//! that one task, only one transition is ever in flight and at most one
//! handle exists per session.
//!
//! Observable flags are mirrored into atomics after every transition so that
//! status queries never wait on the task.

pub mod config;
pub mod state;

pub use config::SessionConfig;
pub use state::{
    is_duplicate_session_conflict, ConnectionState, Effect, Input, SessionMachine,
    SessionSnapshot, DUPLICATE_SESSION_MARKER,
};

use crate::error::{FleetError, SessionError};
use crate::logs::LogBroadcaster;
use crate::protocol::{ClientEvent, ConnectParams, OutboundMessage, ProtocolClient, ProtocolHandle};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// A managed connection to one game server.
pub struct ConnectionSession {
    instance_id: String,
    params: ConnectParams,
    config: SessionConfig,
    client: Arc<dyn ProtocolClient>,
    logs: Arc<LogBroadcaster>,

    state: AtomicU8,
    reconnect_attempts: AtomicU32,
    server_down: AtomicBool,
    started: AtomicBool,

    handle: RwLock<Option<Arc<dyn ProtocolHandle>>>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("instance_id", &self.instance_id)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

/// Per-run bookkeeping owned by the session task.
struct Link {
    events: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    join_deadline: Option<Instant>,
    retry_at: Option<Instant>,
    last_activity: Instant,
    next_watchdog_tick: Instant,
}

/// What woke the session task.
enum Wake {
    Stop,
    Event(Option<ClientEvent>),
    JoinTimeout,
    WatchdogTick,
    RetryDue,
}

impl ConnectionSession {
    /// Creates an idle session. Nothing happens until [`start`](Self::start).
    pub fn new(
        instance_id: impl Into<String>,
        params: ConnectParams,
        config: SessionConfig,
        client: Arc<dyn ProtocolClient>,
        logs: Arc<LogBroadcaster>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            instance_id: instance_id.into(),
            params,
            config,
            client,
            logs,
            state: AtomicU8::new(ConnectionState::Idle.as_u8()),
            reconnect_attempts: AtomicU32::new(0),
            server_down: AtomicBool::new(false),
            started: AtomicBool::new(false),
            handle: RwLock::new(None),
            stop_tx,
            task: Mutex::new(None),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn params(&self) -> &ConnectParams {
        &self.params
    }

    /// Starts the background loop.
    ///
    /// Only the first call on a session does anything; concurrent or repeated
    /// calls, and calls after [`stop`](Self::stop), return `false`.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock().await;
        if *self.stop_tx.borrow() {
            return false;
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(instance = %self.instance_id, "Start ignored, session already running");
            return false;
        }

        let mut machine = SessionMachine::new(&self.config);
        let effects = machine.handle(Input::Start);
        self.publish(&machine);
        info!(
            instance = %self.instance_id,
            "🚀 Starting session for {}:{}", self.params.host, self.params.port
        );

        let stop_rx = self.stop_tx.subscribe();
        let session = Arc::clone(self);
        *task = Some(tokio::spawn(session.run(machine, effects, stop_rx)));
        true
    }

    /// Stops the session from any state and waits for its task to finish.
    ///
    /// Pending pings, connects and backoff waits are cancelled. Stopping is
    /// terminal: the session cannot be started again.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        self.started.store(true, Ordering::SeqCst);

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(instance = %self.instance_id, "Session task ended abnormally: {}", e);
            }
        }
        self.state
            .store(ConnectionState::Idle.as_u8(), Ordering::SeqCst);
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn is_server_down(&self) -> bool {
        self.server_down.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Probing | ConnectionState::Connecting
        )
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state(),
            reconnect_attempts: self.reconnect_attempts(),
            is_server_down: self.is_server_down(),
        }
    }

    /// Sends a chat message as this session's user.
    ///
    /// # Errors
    ///
    /// [`FleetError::NotConnected`] unless the session is joined, or the
    /// protocol error reported by the handle.
    pub async fn send_message(&self, text: &str) -> Result<(), FleetError> {
        if !self.is_connected() {
            return Err(FleetError::NotConnected(self.instance_id.clone()));
        }
        let handle = self
            .handle
            .read()
            .await
            .clone()
            .ok_or_else(|| FleetError::NotConnected(self.instance_id.clone()))?;

        handle
            .send(OutboundMessage::chat(&self.params.username, text))
            .await?;
        self.logs.append(
            &self.instance_id,
            format!("<{}> {}", self.params.username, text),
        );
        Ok(())
    }

    async fn run(
        self: Arc<Self>,
        mut machine: SessionMachine,
        initial: Vec<Effect>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let now = Instant::now();
        let mut link = Link {
            events: None,
            join_deadline: None,
            retry_at: None,
            last_activity: now,
            next_watchdog_tick: now + self.config.heartbeat_interval,
        };
        let mut pending = VecDeque::new();
        let mut effects = initial;

        loop {
            let mut exit = false;
            for effect in effects.drain(..) {
                match effect {
                    Effect::Log(message) => {
                        self.logs.append(&self.instance_id, message);
                    }
                    Effect::Probe => {
                        pending.push_back(self.probe(&mut stop_rx).await);
                    }
                    Effect::OpenConnection => {
                        self.close_connection(&mut link).await;
                        pending.push_back(self.open_connection(&mut link, &mut stop_rx).await);
                    }
                    Effect::CloseConnection => {
                        self.close_connection(&mut link).await;
                    }
                    Effect::ArmWatchdog => {
                        let now = Instant::now();
                        link.join_deadline = None;
                        link.last_activity = now;
                        link.next_watchdog_tick = now + self.config.heartbeat_interval;
                    }
                    Effect::ScheduleRetry(delay) => {
                        link.retry_at = Some(Instant::now() + delay);
                    }
                    Effect::Exit => exit = true,
                }
            }
            if exit {
                break;
            }

            let input = match pending.pop_front() {
                Some(input) => input,
                None => match self.next_input(&machine, &mut link, &mut stop_rx).await {
                    Some(input) => input,
                    None => continue,
                },
            };

            let before = machine.state();
            effects = machine.handle(input);
            self.publish(&machine);
            let after = machine.state();
            if before != after {
                info!(
                    instance = %self.instance_id,
                    from = %before,
                    to = %after,
                    "🔄 Session state changed"
                );
            }
        }

        self.close_connection(&mut link).await;
        self.publish(&machine);
        info!(instance = %self.instance_id, "🛑 Session stopped");
    }

    /// Waits for the next thing that can move the machine.
    async fn next_input(
        &self,
        machine: &SessionMachine,
        link: &mut Link,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Option<Input> {
        let watchdog = (machine.state() == ConnectionState::Connected)
            .then_some(link.next_watchdog_tick);

        let wake = tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stopped| *stopped) => Wake::Stop,
            event = recv_event(&mut link.events) => Wake::Event(event),
            _ = sleep_until_opt(link.join_deadline) => Wake::JoinTimeout,
            _ = sleep_until_opt(watchdog) => Wake::WatchdogTick,
            _ = sleep_until_opt(link.retry_at) => Wake::RetryDue,
        };

        match wake {
            Wake::Stop => Some(Input::Stop),
            Wake::Event(Some(event)) => {
                link.last_activity = Instant::now();
                debug!(instance = %self.instance_id, event = event.name(), "Client event");
                Some(Input::Client(event))
            }
            Wake::Event(None) => {
                // Event stream ended without a close notification.
                link.events = None;
                Some(Input::Client(ClientEvent::Closed))
            }
            Wake::JoinTimeout => {
                link.join_deadline = None;
                Some(Input::ConnectFailed(SessionError::ConnectTimeout))
            }
            Wake::WatchdogTick => {
                link.next_watchdog_tick = Instant::now() + self.config.heartbeat_interval;
                if link.last_activity.elapsed() >= self.config.heartbeat_timeout {
                    warn!(instance = %self.instance_id, "💔 Heartbeat deadline missed");
                    Some(Input::HeartbeatExpired)
                } else {
                    None
                }
            }
            Wake::RetryDue => {
                link.retry_at = None;
                Some(Input::BackoffElapsed)
            }
        }
    }

    /// Pings the target up to `ping_attempts` times.
    async fn probe(&self, stop_rx: &mut watch::Receiver<bool>) -> Input {
        let attempts = self.config.ping_attempts;
        let (host, port) = (self.params.host.as_str(), self.params.port);

        for attempt in 1..=attempts {
            let ping = timeout(
                self.config.ping_timeout,
                self.client.ping(host, port, self.config.ping_timeout),
            );
            let result = tokio::select! {
                biased;
                _ = stop_rx.wait_for(|stopped| *stopped) => return Input::Stop,
                result = ping => result,
            };

            let reason = match result {
                Ok(Ok(())) => {
                    debug!(instance = %self.instance_id, attempt, "Ping answered");
                    return Input::ProbeSucceeded;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", self.config.ping_timeout),
            };
            self.logs.append(
                &self.instance_id,
                format!("Ping attempt {attempt}/{attempts} failed: {reason}"),
            );

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = stop_rx.wait_for(|stopped| *stopped) => return Input::Stop,
                    _ = sleep(self.config.ping_retry_delay) => {}
                }
            }
        }

        Input::ProbeFailed(SessionError::ProbeFailed { attempts })
    }

    /// Requests a fresh handle and starts listening to it.
    ///
    /// `connect_timeout` covers the handshake and the join together.
    async fn open_connection(
        &self,
        link: &mut Link,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Input {
        let deadline = Instant::now() + self.config.connect_timeout;
        let connect = timeout(self.config.connect_timeout, self.client.connect(&self.params));
        let result = tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stopped| *stopped) => return Input::Stop,
            result = connect => result,
        };

        match result {
            Ok(Ok(connection)) => {
                *self.handle.write().await = Some(connection.handle);
                link.events = Some(connection.events);
                link.join_deadline = Some(deadline);
                Input::ConnectOpened
            }
            Ok(Err(e)) => Input::ConnectFailed(SessionError::ConnectFailed(e)),
            Err(_) => {
                warn!(instance = %self.instance_id, "⏱️ Connect did not complete in {:?}", self.config.connect_timeout);
                Input::ConnectFailed(SessionError::ConnectTimeout)
            }
        }
    }

    /// Closes and forgets the current handle along with its event stream.
    async fn close_connection(&self, link: &mut Link) {
        link.events = None;
        link.join_deadline = None;
        let handle = self.handle.write().await.take();
        if let Some(handle) = handle {
            handle.close().await;
            debug!(instance = %self.instance_id, "Closed protocol handle");
        }
    }

    fn publish(&self, machine: &SessionMachine) {
        self.reconnect_attempts
            .store(machine.reconnect_attempts(), Ordering::SeqCst);
        self.server_down
            .store(machine.is_server_down(), Ordering::SeqCst);
        self.state.store(machine.state().as_u8(), Ordering::SeqCst);
    }
}

async fn recv_event(events: &mut Option<mpsc::UnboundedReceiver<ClientEvent>>) -> Option<ClientEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

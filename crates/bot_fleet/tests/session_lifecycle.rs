//! Connection lifecycle tests driven through the scripted mock client.
//!
//! All tests run on paused time, so backoff and heartbeat deadlines elapse
//! instantly but in order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bot_fleet::{
    ClientEvent, ConnectParams, ConnectionSession, ConnectionState, ControlApi, FleetError,
    InstanceConfig, InstanceRegistry, LogBroadcaster, Packet, ProtocolError, SessionConfig,
    TokenIssuer,
};
use bot_fleet_test_utils::{eventually, MockProtocolClient};

fn setup(client: Arc<MockProtocolClient>, session_config: SessionConfig) -> (ControlApi, Arc<InstanceRegistry>) {
    let registry = Arc::new(InstanceRegistry::new(
        client,
        Arc::new(LogBroadcaster::default()),
        session_config,
        "profiles",
    ));
    let control = ControlApi::new(registry.clone(), Arc::new(TokenIssuer::default()));
    (control, registry)
}

fn target() -> InstanceConfig {
    InstanceConfig {
        host: "127.0.0.1".to_string(),
        port: 19132,
        username: "Bonk".to_string(),
        offline_mode: true,
    }
}

fn state_of(control: &ControlApi, id: &str) -> Option<ConnectionState> {
    control.status(id).ok().map(|status| status.connection_state)
}

fn log_contains(registry: &InstanceRegistry, id: &str, needle: &str) -> bool {
    registry
        .logs()
        .entries(id)
        .iter()
        .any(|entry| entry.message.contains(needle))
}

#[tokio::test(start_paused = true)]
async fn test_status_progresses_from_not_found_to_connected() {
    let client = MockProtocolClient::new();
    let (control, _registry) = setup(client.clone(), SessionConfig::default());

    assert_eq!(control.status("a"), Err(FleetError::NotFound("a".to_string())));

    control.start("a", target()).await.unwrap();
    let status = control.status("a").unwrap();
    assert!(!status.is_connected());
    assert!(status.connection_state.is_active());

    let conn = client.wait_for_connections(1).await;
    assert_eq!(state_of(&control, "a"), Some(ConnectionState::Connecting));
    assert_eq!(conn.params.credentials_dir, PathBuf::from("profiles").join("a"));

    conn.join();
    assert!(
        eventually(Duration::from_secs(1), || state_of(&control, "a")
            == Some(ConnectionState::Connected))
        .await
    );

    control.stop("a").await.unwrap();
    assert!(conn.is_closed());
    assert_eq!(state_of(&control, "a"), Some(ConnectionState::Idle));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_start_creates_one_handle() {
    let client = MockProtocolClient::new();
    client.set_connect_delay(Duration::from_secs(1));
    let session = ConnectionSession::new(
        "a",
        ConnectParams {
            host: "127.0.0.1".to_string(),
            port: 19132,
            username: "Bonk".to_string(),
            offline_mode: true,
            credentials_dir: PathBuf::from("profiles/a"),
        },
        SessionConfig::default(),
        client.clone(),
        Arc::new(LogBroadcaster::default()),
    );

    let (first, second) = tokio::join!(session.start(), session.start());
    assert!(first ^ second);

    client.wait_for_connections(1).await;
    assert!(!session.start().await);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(client.connect_count(), 1);
    assert_eq!(session.state(), ConnectionState::Connecting);
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_second_start_command_is_rejected() {
    let client = MockProtocolClient::new();
    let (control, _registry) = setup(client.clone(), SessionConfig::default());

    control.start("a", target()).await.unwrap();
    assert_eq!(
        control.start("a", target()).await,
        Err(FleetError::AlreadyRunning("a".to_string()))
    );

    client.wait_for_connections(1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(client.connect_count(), 1);
    control.stop("a").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_session_disconnect_is_ignored() {
    let client = MockProtocolClient::new();
    let (control, registry) = setup(client.clone(), SessionConfig::default());

    control.start("a", target()).await.unwrap();
    let conn = client.wait_for_connections(1).await;
    conn.join();
    assert!(
        eventually(Duration::from_secs(1), || state_of(&control, "a")
            == Some(ConnectionState::Connected))
        .await
    );

    conn.disconnect("disconnectionScreen.serverIdConflict");
    tokio::time::sleep(Duration::from_secs(10)).await;

    let status = control.status("a").unwrap();
    assert!(status.is_connected());
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(client.connect_count(), 1);
    assert!(!conn.is_closed());
    assert!(log_contains(&registry, "a", "serverIdConflict"));
    control.stop("a").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_reconnects_with_fresh_handle() {
    let client = MockProtocolClient::new();
    let (control, _registry) = setup(client.clone(), SessionConfig::default());

    control.start("a", target()).await.unwrap();
    let first = client.wait_for_connections(1).await;
    first.join();
    tokio::time::sleep(Duration::from_millis(10)).await;

    first.disconnect("Kicked by an operator");
    assert!(
        eventually(Duration::from_secs(1), || state_of(&control, "a")
            == Some(ConnectionState::Reconnecting))
        .await
    );
    let status = control.status("a").unwrap();
    assert_eq!(status.reconnect_attempts, 1);
    assert!(!status.is_server_down);
    assert!(first.is_closed());

    // Base delay is 5s while the server is up.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(client.connections().len(), 1);

    let second = client.wait_for_connections(2).await;
    assert!(!second.is_closed());
    second.join();
    assert!(
        eventually(Duration::from_secs(1), || state_of(&control, "a")
            == Some(ConnectionState::Connected))
        .await
    );
    assert_eq!(control.status("a").unwrap().reconnect_attempts, 0);
    control.stop("a").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_errored_doubles_backoff_until_joined() {
    let client = MockProtocolClient::new();
    let (control, _registry) = setup(client.clone(), SessionConfig::default());

    control.start("a", target()).await.unwrap();
    let first = client.wait_for_connections(1).await;
    first.join();
    tokio::time::sleep(Duration::from_millis(10)).await;

    first.emit(ClientEvent::Errored("socket reset".to_string()));
    assert!(
        eventually(Duration::from_secs(1), || control
            .status("a")
            .map(|s| s.is_server_down)
            .unwrap_or(false))
        .await
    );

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(client.connections().len(), 1);

    let second = client.wait_for_connections(2).await;
    second.join();
    assert!(
        eventually(Duration::from_secs(1), || state_of(&control, "a")
            == Some(ConnectionState::Connected))
        .await
    );
    assert!(!control.status("a").unwrap().is_server_down);
    control.stop("a").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_keeps_active_connection_and_drops_silent_one() {
    let client = MockProtocolClient::new();
    let (control, _registry) = setup(client.clone(), SessionConfig::default());

    control.start("a", target()).await.unwrap();
    let first = client.wait_for_connections(1).await;
    first.join();

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        first.emit(ClientEvent::PacketReceived(Packet {
            name: "move_player".to_string(),
            params: serde_json::Value::Null,
        }));
    }
    assert_eq!(state_of(&control, "a"), Some(ConnectionState::Connected));
    assert_eq!(client.connect_count(), 1);

    // Silence: the watchdog gives up after the 30s heartbeat timeout.
    assert!(
        eventually(Duration::from_secs(40), || first.is_closed()).await
    );
    assert!(matches!(
        state_of(&control, "a"),
        Some(ConnectionState::Reconnecting)
    ));

    client.wait_for_connections(2).await;
    control.stop("a").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_reconnects() {
    let client = MockProtocolClient::new();
    let (control, _registry) = setup(client.clone(), SessionConfig::default());

    control.start("a", target()).await.unwrap();
    let first = client.wait_for_connections(1).await;

    tokio::time::sleep(Duration::from_secs(19)).await;
    assert!(!first.is_closed());

    assert!(eventually(Duration::from_secs(2), || first.is_closed()).await);
    let status = control.status("a").unwrap();
    assert_eq!(status.connection_state, ConnectionState::Reconnecting);
    assert!(status.is_server_down);

    let second = client.wait_for_connections(2).await;
    assert!(!second.is_closed());
    control.stop("a").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_hanging_handshake_times_out_and_retries() {
    let client = MockProtocolClient::new();
    client.set_connect_delay(Duration::from_secs(3600));
    let (control, _registry) = setup(client.clone(), SessionConfig::default());

    control.start("a", target()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(19)).await;
    assert_eq!(state_of(&control, "a"), Some(ConnectionState::Connecting));

    assert!(
        eventually(Duration::from_secs(2), || state_of(&control, "a")
            == Some(ConnectionState::Reconnecting))
        .await
    );
    assert!(control.status("a").unwrap().is_server_down);
    assert_eq!(client.connect_count(), 1);

    // Server-down backoff of 10s, then a new attempt.
    assert!(eventually(Duration::from_secs(15), || client.connect_count() == 2).await);
    control.stop("a").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_marks_server_down() {
    let client = MockProtocolClient::new();
    client.fail_next_connect(ProtocolError::Connect("authentication rejected".to_string()));
    let (control, registry) = setup(client.clone(), SessionConfig::default());

    control.start("a", target()).await.unwrap();
    assert!(
        eventually(Duration::from_secs(1), || state_of(&control, "a")
            == Some(ConnectionState::Reconnecting))
        .await
    );
    assert!(control.status("a").unwrap().is_server_down);
    assert!(log_contains(&registry, "a", "authentication rejected"));

    // Server-down backoff is twice the 5s base.
    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(client.connect_count(), 1);
    client.wait_for_connections(1).await;
    assert_eq!(client.connect_count(), 2);
    control.stop("a").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_server_cycles_without_giving_up() {
    let client = MockProtocolClient::unreachable();
    let config = SessionConfig {
        max_reconnect_attempts: 3,
        base_reconnect_delay: Duration::from_secs(1),
        ..SessionConfig::default()
    };
    let (control, _registry) = setup(client.clone(), config);
    control.start("a", target()).await.unwrap();

    let mut highest = 0;
    let mut reset_after_max = false;
    for _ in 0..1200 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let attempts = control.status("a").unwrap().reconnect_attempts;
        assert!(attempts <= 3);
        if highest == 3 && attempts == 0 {
            reset_after_max = true;
        }
        highest = highest.max(attempts);
    }

    assert_eq!(highest, 3);
    assert!(reset_after_max);
    assert_eq!(client.connect_count(), 0);
    assert_ne!(state_of(&control, "a"), Some(ConnectionState::Idle));
    control.stop("a").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_probe_recovers_within_attempts() {
    let client = MockProtocolClient::new();
    client.script_pings([
        Err(ProtocolError::Ping {
            host: "127.0.0.1".to_string(),
            port: 19132,
            reason: "timeout".to_string(),
        }),
        Ok(()),
    ]);
    let (control, registry) = setup(client.clone(), SessionConfig::default());

    control.start("a", target()).await.unwrap();
    client.wait_for_connections(1).await;

    assert_eq!(client.ping_count(), 2);
    assert_eq!(control.status("a").unwrap().reconnect_attempts, 0);
    assert!(log_contains(&registry, "a", "Ping attempt 1/3 failed"));
    control.stop("a").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_backoff() {
    let client = MockProtocolClient::unreachable();
    let (control, _registry) = setup(client.clone(), SessionConfig::default());

    control.start("a", target()).await.unwrap();
    assert!(
        eventually(Duration::from_secs(10), || state_of(&control, "a")
            == Some(ConnectionState::Reconnecting))
        .await
    );
    let pings = client.ping_count();

    control.stop("a").await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(client.ping_count(), pings);
    assert_eq!(state_of(&control, "a"), Some(ConnectionState::Idle));
}

#[tokio::test(start_paused = true)]
async fn test_chat_requires_joined_session() {
    let client = MockProtocolClient::new();
    let (control, registry) = setup(client.clone(), SessionConfig::default());

    assert_eq!(
        control.chat("a", "hi").await,
        Err(FleetError::NotFound("a".to_string()))
    );

    control.start("a", target()).await.unwrap();
    let conn = client.wait_for_connections(1).await;
    assert_eq!(
        control.chat("a", "hi").await,
        Err(FleetError::NotConnected("a".to_string()))
    );

    conn.join();
    assert!(
        eventually(Duration::from_secs(1), || state_of(&control, "a")
            == Some(ConnectionState::Connected))
        .await
    );
    control.chat("a", "hello there").await.unwrap();

    let sent = conn.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, "text");
    assert_eq!(sent[0].payload["type"], "chat");
    assert_eq!(sent[0].payload["source_name"], "Bonk");
    assert_eq!(sent[0].payload["message"], "hello there");
    assert!(log_contains(&registry, "a", "<Bonk> hello there"));

    control.stop("a").await.unwrap();
    assert_eq!(
        control.chat("a", "bye").await,
        Err(FleetError::NotConnected("a".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_inbound_events_reach_the_log() {
    let client = MockProtocolClient::new();
    let (control, registry) = setup(client.clone(), SessionConfig::default());

    control.start("a", target()).await.unwrap();
    let conn = client.wait_for_connections(1).await;
    conn.join();
    conn.emit(ClientEvent::Spawned);
    conn.chat("Steve", "hi bot");

    assert!(
        eventually(Duration::from_secs(1), || log_contains(&registry, "a", "<Steve> hi bot")).await
    );
    assert!(log_contains(&registry, "a", "Spawned"));
    assert!(log_contains(&registry, "a", "Joined"));
    control.stop("a").await.unwrap();
}

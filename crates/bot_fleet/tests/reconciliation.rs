use std::sync::Arc;
use std::time::Duration;

use bot_fleet::{
    ConfigReconciler, ConnectionState, DesiredInstance, DesiredState, InstanceRegistry,
    LogBroadcaster, SessionConfig,
};
use bot_fleet_test_utils::{eventually, MockProtocolClient};

fn registry(client: Arc<MockProtocolClient>) -> Arc<InstanceRegistry> {
    Arc::new(InstanceRegistry::new(
        client,
        Arc::new(LogBroadcaster::default()),
        SessionConfig::default(),
        "profiles",
    ))
}

fn desired(id: &str, disabled: bool) -> DesiredState {
    let mut state = DesiredState::default();
    state.instances.insert(
        id.to_string(),
        DesiredInstance {
            host: "127.0.0.1".to_string(),
            port: 19132,
            username: "Alpha".to_string(),
            offline_mode: false,
            disabled,
        },
    );
    state
}

#[tokio::test(start_paused = true)]
async fn test_enable_disable_cycle() {
    let client = MockProtocolClient::new();
    let registry = registry(client.clone());
    let reconciler = ConfigReconciler::new(registry.clone());

    let report = reconciler.reconcile(&desired("a", false)).await;
    assert_eq!(report.started, vec!["a".to_string()]);
    assert!(report.stopped.is_empty());

    let conn = client.wait_for_connections(1).await;
    conn.join();
    assert!(
        eventually(Duration::from_secs(1), || registry
            .status("a")
            .map(|s| s.is_connected())
            .unwrap_or(false))
        .await
    );
    let logged = registry.logs().len("a");
    assert!(logged > 0);

    let report = reconciler.reconcile(&desired("a", true)).await;
    assert_eq!(report.stopped, vec!["a".to_string()]);
    assert!(report.started.is_empty());
    assert!(conn.is_closed());
    assert_eq!(
        registry.status("a").unwrap().connection_state,
        ConnectionState::Idle
    );
    assert!(registry.logs().len("a") >= logged);

    let report = reconciler.reconcile(&desired("a", true)).await;
    assert!(report.is_noop());
    assert_eq!(client.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_same_state_twice_is_idempotent() {
    let client = MockProtocolClient::new();
    let registry = registry(client.clone());
    let reconciler = ConfigReconciler::new(registry.clone());

    let state = desired("a", false);
    assert_eq!(reconciler.reconcile(&state).await.started.len(), 1);
    client.wait_for_connections(1).await;

    let report = reconciler.reconcile(&state).await;
    assert!(report.is_noop());
    assert!(report.updated.is_empty());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(client.connect_count(), 1);
    registry.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_reenabling_starts_a_fresh_session() {
    let client = MockProtocolClient::new();
    let registry = registry(client.clone());
    let reconciler = ConfigReconciler::new(registry.clone());

    reconciler.reconcile(&desired("a", false)).await;
    let first = client.wait_for_connections(1).await;
    reconciler.reconcile(&desired("a", true)).await;
    assert!(first.is_closed());

    let report = reconciler.reconcile(&desired("a", false)).await;
    assert_eq!(report.started, vec!["a".to_string()]);
    let second = client.wait_for_connections(2).await;
    assert!(!second.is_closed());
    registry.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_removed_entry_is_stopped() {
    let client = MockProtocolClient::new();
    let registry = registry(client.clone());
    let reconciler = ConfigReconciler::new(registry.clone());

    reconciler.reconcile(&desired("a", false)).await;
    client.wait_for_connections(1).await;

    let report = reconciler.reconcile(&DesiredState::default()).await;
    assert_eq!(report.stopped, vec!["a".to_string()]);
    assert!(registry.contains("a"));
    assert!(!registry.is_running("a"));
}

//! Brings the registry in line with the desired state.
//!
//! Reconciliation only issues the starts and stops needed to close the gap
//! between what runs and what should run, so applying the same desired state
//! twice is a no-op. Edits to a running instance's target are recorded but
//! only take effect the next time it starts.

use crate::config::DesiredState;
use crate::error::FleetError;
use crate::registry::InstanceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// What a reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    /// Instances whose recorded config changed without a restart.
    pub updated: Vec<String>,
    pub failed: Vec<(String, FleetError)>,
}

impl ReconcileReport {
    /// True when no start or stop was issued.
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// Reconciles desired state against an [`InstanceRegistry`].
#[derive(Debug, Clone)]
pub struct ConfigReconciler {
    registry: Arc<InstanceRegistry>,
}

impl ConfigReconciler {
    pub fn new(registry: Arc<InstanceRegistry>) -> Self {
        Self { registry }
    }

    /// Runs one reconciliation pass.
    ///
    /// Running instances that are absent from `desired` or disabled are
    /// stopped. Enabled entries without a session are started. Everything
    /// listed gets its config recorded so that status and the next cold start
    /// see the latest target.
    pub async fn reconcile(&self, desired: &DesiredState) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        // Disabled flags are applied before any stop or start.
        for (id, instance) in &desired.instances {
            if instance.disabled {
                self.registry.record_config(id, instance.to_config());
            }
            self.registry.set_disabled(id, instance.disabled);
        }

        for id in self.registry.running_ids() {
            if desired.is_enabled(&id) {
                continue;
            }
            match self.registry.stop(&id).await {
                Ok(()) => {
                    info!(instance = %id, "Reconciler stopped instance");
                    report.stopped.push(id);
                }
                Err(e) => {
                    warn!(instance = %id, "Reconciler failed to stop instance: {}", e);
                    report.failed.push((id, e));
                }
            }
        }

        for (id, instance) in desired.enabled() {
            let config = instance.to_config();

            if self.registry.is_running(id) {
                if self.registry.record_config(id, config) {
                    debug!(instance = %id, "Config change recorded, applies on next start");
                    report.updated.push(id.clone());
                }
                continue;
            }

            match self.registry.start(id, config).await {
                Ok(()) => {
                    info!(instance = %id, "Reconciler started instance");
                    report.started.push(id.clone());
                }
                // Started concurrently through the control surface.
                Err(FleetError::AlreadyRunning(_)) => {}
                Err(e) => {
                    warn!(instance = %id, "Reconciler failed to start instance: {}", e);
                    report.failed.push((id.clone(), e));
                }
            }
        }

        if report.is_noop() {
            debug!("Reconciliation found nothing to do");
        } else {
            info!(
                "🔁 Reconciled: {} started, {} stopped",
                report.started.len(),
                report.stopped.len()
            );
        }
        report
    }

    /// Reconciles the current snapshot, then every change until shutdown.
    ///
    /// Bursts of changes are debounced: a pass runs once `debounce` has
    /// passed without a new snapshot, and always against the latest one.
    pub async fn run(
        &self,
        mut desired: watch::Receiver<DesiredState>,
        debounce: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let snapshot = desired.borrow_and_update().clone();
        self.reconcile(&snapshot).await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                changed = desired.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => return,
                    changed = desired.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep(debounce) => break,
                }
            }

            let snapshot = desired.borrow_and_update().clone();
            self.reconcile(&snapshot).await;
        }
        debug!("Reconciler loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DesiredInstance;
    use crate::error::ProtocolError;
    use crate::logs::LogBroadcaster;
    use crate::protocol::{ConnectParams, Connection, ProtocolClient};
    use crate::session::SessionConfig;
    use async_trait::async_trait;

    struct UnreachableClient;

    #[async_trait]
    impl ProtocolClient for UnreachableClient {
        async fn ping(&self, host: &str, port: u16, _timeout: Duration) -> Result<(), ProtocolError> {
            Err(ProtocolError::Ping {
                host: host.to_string(),
                port,
                reason: "unreachable".to_string(),
            })
        }

        async fn connect(&self, _params: &ConnectParams) -> Result<Connection, ProtocolError> {
            Err(ProtocolError::Connect("unreachable".to_string()))
        }
    }

    fn registry() -> Arc<InstanceRegistry> {
        Arc::new(InstanceRegistry::new(
            Arc::new(UnreachableClient),
            Arc::new(LogBroadcaster::default()),
            SessionConfig::default(),
            "profiles",
        ))
    }

    fn desired(entries: &[(&str, bool)]) -> DesiredState {
        let mut state = DesiredState::default();
        for (id, disabled) in entries {
            state.instances.insert(
                id.to_string(),
                DesiredInstance {
                    host: "127.0.0.1".to_string(),
                    port: 19132,
                    username: format!("{id}_bot"),
                    offline_mode: true,
                    disabled: *disabled,
                },
            );
        }
        state
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_entry_is_recorded_not_started() {
        let registry = registry();
        let reconciler = ConfigReconciler::new(registry.clone());

        let report = reconciler.reconcile(&desired(&[("a", true)])).await;
        assert!(report.is_noop());
        assert!(registry.contains("a"));
        assert!(!registry.is_running("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_entry_rejects_manual_start() {
        let registry = registry();
        let reconciler = ConfigReconciler::new(registry.clone());
        let state = desired(&[("a", true)]);
        reconciler.reconcile(&state).await;

        let config = state.instances["a"].to_config();
        assert_eq!(
            registry.start("a", config).await,
            Err(FleetError::Disabled("a".to_string()))
        );
        assert!(!registry.is_running("a"));
        assert!(reconciler.reconcile(&state).await.is_noop());

        let report = reconciler.reconcile(&desired(&[("a", false)])).await;
        assert_eq!(report.started, vec!["a".to_string()]);
        registry.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_instance_is_stopped() {
        let registry = registry();
        let reconciler = ConfigReconciler::new(registry.clone());

        reconciler.reconcile(&desired(&[("a", false), ("b", false)])).await;
        let report = reconciler.reconcile(&desired(&[("a", false)])).await;

        assert_eq!(report.stopped, vec!["b".to_string()]);
        assert!(report.started.is_empty());
        assert!(registry.is_running("a"));
        assert!(!registry.is_running("b"));
        registry.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_edit_does_not_restart() {
        let registry = registry();
        let reconciler = ConfigReconciler::new(registry.clone());
        reconciler.reconcile(&desired(&[("a", false)])).await;

        let mut edited = desired(&[("a", false)]);
        if let Some(a) = edited.instances.get_mut("a") {
            a.port = 19200;
        }
        let report = reconciler.reconcile(&edited).await;

        assert!(report.is_noop());
        assert_eq!(report.updated, vec!["a".to_string()]);
        assert_eq!(registry.live_params("a").map(|p| p.port), Some(19132));
        assert_eq!(registry.config("a").map(|c| c.port), Some(19200));
        registry.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_debounces_to_latest_snapshot() {
        let registry = registry();
        let reconciler = ConfigReconciler::new(registry.clone());
        let (desired_tx, desired_rx) = watch::channel(DesiredState::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn({
            let reconciler = reconciler.clone();
            async move {
                reconciler
                    .run(desired_rx, Duration::from_millis(500), shutdown_rx)
                    .await
            }
        });
        // Let the initial pass over the empty snapshot finish.
        tokio::time::sleep(Duration::from_millis(10)).await;

        desired_tx.send_replace(desired(&[("a", false)]));
        tokio::time::sleep(Duration::from_millis(100)).await;
        desired_tx.send_replace(desired(&[("b", false)]));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!registry.contains("a"));
        assert!(registry.is_running("b"));

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        registry.stop_all().await;
    }
}

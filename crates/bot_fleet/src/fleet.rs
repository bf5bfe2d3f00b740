//! Fleet composition root.
//!
//! Builds the shared components once and wires them together: one log
//! broadcaster, one token issuer, one registry, one reconciler. Everything
//! that needs them receives them from here.

use crate::config::{DesiredStateStore, FleetConfig};
use crate::control::ControlApi;
use crate::error::ConfigError;
use crate::logs::LogBroadcaster;
use crate::protocol::ProtocolClient;
use crate::reconciler::ConfigReconciler;
use crate::registry::InstanceRegistry;
use crate::tokens::TokenIssuer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

/// A running fleet of bot instances.
pub struct Fleet {
    config: FleetConfig,
    logs: Arc<LogBroadcaster>,
    tokens: Arc<TokenIssuer>,
    registry: Arc<InstanceRegistry>,
    reconciler: ConfigReconciler,
    store: DesiredStateStore,
    /// Channel for coordinating fleet shutdown
    shutdown_sender: broadcast::Sender<()>,
    /// Set before the shutdown signal is sent, for a `run` that subscribes late
    shutdown_requested: AtomicBool,
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("registry", &self.registry)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Fleet {
    /// Creates a fleet with the given configuration and protocol client.
    pub fn new(config: FleetConfig, client: Arc<dyn ProtocolClient>) -> Self {
        let logs = Arc::new(LogBroadcaster::new(config.logs.buffer_capacity));
        let tokens = Arc::new(TokenIssuer::new(config.logs.token_ttl()));
        let registry = Arc::new(InstanceRegistry::new(
            client,
            Arc::clone(&logs),
            config.session.to_session_config(),
            config.store.credentials_dir.clone(),
        ));
        let reconciler = ConfigReconciler::new(Arc::clone(&registry));
        let store = DesiredStateStore::new(config.store.instances_file.clone());
        let (shutdown_sender, _) = broadcast::channel(1);

        Self {
            config,
            logs,
            tokens,
            registry,
            reconciler,
            store,
            shutdown_sender,
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Command surface bound to this fleet.
    pub fn control(&self) -> ControlApi {
        ControlApi::new(Arc::clone(&self.registry), Arc::clone(&self.tokens))
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn logs(&self) -> &Arc<LogBroadcaster> {
        &self.logs
    }

    pub fn tokens(&self) -> &Arc<TokenIssuer> {
        &self.tokens
    }

    pub fn reconciler(&self) -> &ConfigReconciler {
        &self.reconciler
    }

    pub fn store(&self) -> &DesiredStateStore {
        &self.store
    }

    /// Runs the fleet until [`shutdown`](Self::shutdown) is called.
    ///
    /// Loads the desired state, reconciles it, then follows changes to the
    /// instances file if watching is enabled. Expired log tokens are swept
    /// once per token lifetime. All sessions are stopped before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the instances file cannot be loaded or watched at
    /// startup. Later reload failures are logged and skipped.
    pub async fn run(&self) -> Result<(), ConfigError> {
        let mut shutdown = self.shutdown_sender.subscribe();
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Ok(());
        }
        let initial = self.store.load().await?;
        info!("🤖 Fleet starting with {} desired instance(s)", initial.len());

        let sweep = self.spawn_token_sweep();

        if self.config.store.watch {
            let (desired, _watcher) = self.store.watch(initial)?;
            self.reconciler
                .run(desired, self.config.store.debounce(), shutdown)
                .await;
        } else {
            self.reconciler.reconcile(&initial).await;
            let _ = shutdown.recv().await;
        }

        sweep.abort();
        self.registry.stop_all().await;
        info!("Fleet stopped");
        Ok(())
    }

    /// Signals [`run`](Self::run) to exit and stops every running session.
    pub async fn shutdown(&self) {
        info!("🛑 Fleet shutting down");
        self.shutdown_requested.store(true, Ordering::SeqCst);
        let _ = self.shutdown_sender.send(());
        self.registry.stop_all().await;
    }

    fn spawn_token_sweep(&self) -> JoinHandle<()> {
        let tokens = Arc::clone(&self.tokens);
        let period = self.config.logs.token_ttl();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let purged = tokens.purge_expired();
                if purged > 0 {
                    debug!(purged, "Token sweep");
                }
            }
        })
    }
}

/// Creates a fleet with default configuration.
pub fn create_fleet(client: Arc<dyn ProtocolClient>) -> Fleet {
    Fleet::new(FleetConfig::default(), client)
}

/// Creates a fleet with the given configuration.
pub fn create_fleet_with_config(config: FleetConfig, client: Arc<dyn ProtocolClient>) -> Fleet {
    Fleet::new(config, client)
}

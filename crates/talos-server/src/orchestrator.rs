//! Control-plane orchestration: component wiring, background workers, and
//! graceful shutdown.

use std::sync::Arc;

use talos_audit::{DomainEvent, EventPublisher, MemorySink, TracingSink};
use talos_registry::{GateConfig, RegistryGate};
use talos_rollout::{
    HealthEvaluator, HealthEvaluatorConfig, MonitorConfig, RollbackConfig, RollbackCoordinator,
    RolloutMonitor, RolloutStore, WebhookIntake,
};
use talos_store::{
    CurrentStateStore, DeviceStore, PolicyStore, TargetStateService, TemplateStore,
};
use tokio::sync::watch;
use tracing::info;

use crate::config::ServerConfig;
use crate::routes;
use crate::state::AppState;

/// Wires the control plane together and supervises its workers.
pub struct Orchestrator {
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Orchestrator {
    /// Builds all components from the configuration.
    pub fn new(config: ServerConfig) -> Self {
        let events = Arc::new(MemorySink::new(config.event_retention));
        let publisher = Arc::new(
            EventPublisher::builder()
                .with_sink(events.clone())
                .with_sink(Arc::new(TracingSink::new()))
                .build(),
        );

        let devices = Arc::new(DeviceStore::new());
        let target_state = Arc::new(TargetStateService::new(publisher.clone()));
        let current_state = Arc::new(CurrentStateStore::new());
        let policies = Arc::new(PolicyStore::new());
        let templates = Arc::new(TemplateStore::new());
        let rollouts = Arc::new(RolloutStore::new());

        let mut gate_config = GateConfig::default();
        for prefix in &config.internal_image_prefixes {
            gate_config = gate_config.with_internal_prefix(prefix.clone());
        }
        let gate = Arc::new(RegistryGate::new(gate_config).with_publisher(publisher.clone()));

        let rollback = Arc::new(RollbackCoordinator::new(
            target_state.clone(),
            rollouts.clone(),
            publisher.clone(),
            RollbackConfig {
                concurrency: config.rollback_concurrency,
            },
        ));
        let monitor = Arc::new(RolloutMonitor::new(
            MonitorConfig {
                tick_interval: config.monitor_tick,
            },
            rollouts.clone(),
            target_state.clone(),
            devices.clone(),
            current_state.clone(),
            HealthEvaluator::new(HealthEvaluatorConfig {
                concurrency: config.health_concurrency,
            }),
            rollback,
            publisher.clone(),
        ));
        let intake = Arc::new(WebhookIntake::new(
            policies.clone(),
            gate.clone(),
            devices.clone(),
            target_state.clone(),
            rollouts.clone(),
            publisher.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = AppState {
            config: Arc::new(config),
            devices,
            target_state,
            current_state,
            policies,
            templates,
            gate,
            rollouts,
            monitor,
            intake,
            publisher,
            events,
        };

        Self {
            state,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Returns a handle to the shared state (for tests and embedding).
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Runs the HTTP server and background workers until SIGINT/SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = self.state.config.clone();

        // The rollout monitor: exactly one per deployment.
        let monitor = self.state.monitor.clone();
        let monitor_shutdown = self.shutdown_rx.clone();
        let monitor_task = tokio::spawn(async move {
            monitor.run(monitor_shutdown).await;
        });

        // Offline sweep.
        let sweep_task = tokio::spawn(Self::offline_sweep(
            self.state.clone(),
            self.shutdown_rx.clone(),
        ));

        let router = routes::router(self.state.clone());
        let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
        info!(addr = %config.listen_addr, "control plane listening");

        let shutdown_tx = self.shutdown_tx.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                // Workers finish their current pass, then exit.
                let _ = shutdown_tx.send(true);
            })
            .await?;

        let _ = self.shutdown_tx.send(true);
        let _ = monitor_task.await;
        let _ = sweep_task.await;
        info!("control plane stopped");
        Ok(())
    }

    /// Periodically marks silent devices offline.
    async fn offline_sweep(state: AppState, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(state.config.offline_sweep_interval);
        let threshold = chrono::Duration::from_std(state.config.offline_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for uuid in state.devices.sweep_offline(threshold).await {
                        state.publisher.publish(DomainEvent::device_offline(&uuid));
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

//! Shared application state handed to every request handler.

use std::sync::Arc;

use talos_audit::{EventPublisher, MemorySink};
use talos_registry::RegistryGate;
use talos_rollout::{RolloutMonitor, RolloutStore, WebhookIntake};
use talos_store::{
    CurrentStateStore, DeviceStore, PolicyStore, TargetStateService, TemplateStore,
};

use crate::config::ServerConfig;

/// Handles to every component a request handler may need.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,

    /// Device registry.
    pub devices: Arc<DeviceStore>,

    /// Target-state service (sole writer of target state).
    pub target_state: Arc<TargetStateService>,

    /// Current-state store.
    pub current_state: Arc<CurrentStateStore>,

    /// Update-policy store.
    pub policies: Arc<PolicyStore>,

    /// Application template catalog.
    pub templates: Arc<TemplateStore>,

    /// Image registry and admission gate.
    pub gate: Arc<RegistryGate>,

    /// Rollout store.
    pub rollouts: Arc<RolloutStore>,

    /// Rollout monitor (also the admin entry point for rollout commands).
    pub monitor: Arc<RolloutMonitor>,

    /// Webhook intake pipeline.
    pub intake: Arc<WebhookIntake>,

    /// Domain event publisher.
    pub publisher: Arc<EventPublisher>,

    /// Recent-events sink backing the admin detail views.
    pub events: Arc<MemorySink>,
}

//! Webhook intake: adapter from external registry push notifications to
//! rollout creation.
//!
//! Provider payloads differ in shape, so each supported provider gets its
//! own tagged variant and parser producing a common [`PushEvent`]. The
//! intake pipeline then resolves the update policy, runs the admission
//! gate, plans the rollout, and persists it.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use talos_audit::{DomainEvent, EventPublisher};
use talos_core::{Rollout, RolloutId};
use talos_registry::{Admission, RegistryGate};
use talos_store::{DeviceStore, PolicyStore, TargetStateService};
use tracing::{info, warn};

use crate::error::{Result, RolloutError};
use crate::planner::plan_rollout;
use crate::store::RolloutStore;

/// A normalized registry push notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    /// Registry host the push landed on.
    pub registry: String,

    /// Full image name.
    pub image: String,

    /// Pushed tag.
    pub tag: String,

    /// Content digest, when the provider sends one.
    pub digest: Option<String>,

    /// Provider identifier the payload came from.
    pub provider: String,
}

/// Provider-specific payload variants.
#[derive(Debug)]
enum ProviderPayload {
    DockerHub(DockerHubPayload),
    Ghcr(GhcrPayload),
    Generic(GenericPayload),
}

/// Docker Hub `push` webhook shape (the fields we consume).
#[derive(Debug, Deserialize)]
struct DockerHubPayload {
    repository: DockerHubRepository,
    push_data: DockerHubPushData,
}

#[derive(Debug, Deserialize)]
struct DockerHubRepository {
    repo_name: String,
}

#[derive(Debug, Deserialize)]
struct DockerHubPushData {
    tag: String,
}

/// GitHub container registry `package` webhook shape (the fields we
/// consume).
#[derive(Debug, Deserialize)]
struct GhcrPayload {
    package: GhcrPackage,
}

#[derive(Debug, Deserialize)]
struct GhcrPackage {
    name: String,
    namespace: Option<String>,
    package_version: GhcrPackageVersion,
}

#[derive(Debug, Deserialize)]
struct GhcrPackageVersion {
    container_metadata: GhcrContainerMetadata,
}

#[derive(Debug, Deserialize)]
struct GhcrContainerMetadata {
    tag: GhcrTag,
}

#[derive(Debug, Deserialize)]
struct GhcrTag {
    name: String,
}

/// Catch-all shape for registries that can POST a flat JSON body.
#[derive(Debug, Deserialize)]
struct GenericPayload {
    registry: Option<String>,
    image: String,
    tag: String,
    digest: Option<String>,
}

/// Parses a provider payload into a normalized [`PushEvent`].
pub fn parse_payload(provider: &str, payload: &Value) -> Result<PushEvent> {
    let malformed = |reason: String| RolloutError::MalformedPayload {
        provider: provider.to_string(),
        reason,
    };

    let parsed = match provider {
        "dockerhub" => serde_json::from_value(payload.clone())
            .map(ProviderPayload::DockerHub)
            .map_err(|e| malformed(e.to_string()))?,
        "ghcr" => serde_json::from_value(payload.clone())
            .map(ProviderPayload::Ghcr)
            .map_err(|e| malformed(e.to_string()))?,
        "generic" => serde_json::from_value(payload.clone())
            .map(ProviderPayload::Generic)
            .map_err(|e| malformed(e.to_string()))?,
        other => return Err(malformed(format!("unknown provider '{other}'"))),
    };

    let event = match parsed {
        ProviderPayload::DockerHub(p) => PushEvent {
            registry: "docker.io".to_string(),
            image: p.repository.repo_name,
            tag: p.push_data.tag,
            digest: None,
            provider: provider.to_string(),
        },
        ProviderPayload::Ghcr(p) => {
            let image = match &p.package.namespace {
                Some(ns) => format!("{ns}/{}", p.package.name),
                None => p.package.name.clone(),
            };
            PushEvent {
                registry: "ghcr.io".to_string(),
                image,
                tag: p.package.package_version.container_metadata.tag.name,
                digest: None,
                provider: provider.to_string(),
            }
        }
        ProviderPayload::Generic(p) => PushEvent {
            registry: p.registry.unwrap_or_else(|| "docker.io".to_string()),
            image: p.image,
            tag: p.tag,
            digest: p.digest,
            provider: provider.to_string(),
        },
    };

    if event.image.is_empty() || event.tag.is_empty() {
        return Err(malformed("empty image or tag".to_string()));
    }
    Ok(event)
}

/// Outcome of an accepted webhook.
#[derive(Debug, Clone)]
pub enum IntakeOutcome {
    /// A rollout was planned and persisted.
    RolloutCreated(Rollout),

    /// A rollout for this `(image, tag)` is already active.
    DuplicateRollout(RolloutId),

    /// No device is affected; nothing was created.
    NoAffectedDevices,
}

/// The webhook intake pipeline.
pub struct WebhookIntake {
    policies: Arc<PolicyStore>,
    gate: Arc<RegistryGate>,
    devices: Arc<DeviceStore>,
    target_state: Arc<TargetStateService>,
    rollouts: Arc<RolloutStore>,
    publisher: Arc<EventPublisher>,
}

impl WebhookIntake {
    /// Creates a new intake.
    pub fn new(
        policies: Arc<PolicyStore>,
        gate: Arc<RegistryGate>,
        devices: Arc<DeviceStore>,
        target_state: Arc<TargetStateService>,
        rollouts: Arc<RolloutStore>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            policies,
            gate,
            devices,
            target_state,
            rollouts,
            publisher,
        }
    }

    /// Processes one registry push notification.
    ///
    /// Pipeline: parse → policy match → admission → plan → persist. The
    /// created rollout starts on the next monitor tick. A duplicate push
    /// for an already-active `(image, tag)` returns the existing rollout id
    /// and creates nothing.
    pub async fn receive(&self, provider: &str, payload: &Value) -> Result<IntakeOutcome> {
        let push = parse_payload(provider, payload)?;
        self.publisher.publish(DomainEvent::image_webhook_received(
            &push.image,
            &push.tag,
            &push.provider,
        ));
        info!(
            provider = %push.provider,
            image = %push.image,
            tag = %push.tag,
            "registry push received"
        );

        let policy = self
            .policies
            .select(&push.image, &push.tag)
            .await
            .ok_or_else(|| RolloutError::PolicyNotMatched {
                image: push.image.clone(),
                tag: push.tag.clone(),
            })?;

        match self.gate.admit(&push.registry, &push.image, &push.tag).await {
            Admission::Admitted => {}
            Admission::PendingApproval => {
                return Err(RolloutError::NotAdmitted {
                    image: push.image,
                    tag: push.tag,
                    reason: "pending approval".to_string(),
                    deprecated: false,
                });
            }
            Admission::Rejected { reason } => {
                return Err(RolloutError::NotAdmitted {
                    image: push.image,
                    tag: push.tag,
                    reason,
                    deprecated: false,
                });
            }
            Admission::Deprecated => {
                return Err(RolloutError::NotAdmitted {
                    image: push.image,
                    tag: push.tag,
                    reason: "deprecated".to_string(),
                    deprecated: true,
                });
            }
        }

        let documents = self.target_state.all().await;
        let devices = self.devices.list().await;
        let Some(plan) = plan_rollout(&documents, &devices, &policy, &push.image, &push.tag)
        else {
            info!(image = %push.image, tag = %push.tag, "no affected devices, nothing to roll out");
            return Ok(IntakeOutcome::NoAffectedDevices);
        };

        match self
            .rollouts
            .create(&push.image, &push.tag, policy, &plan)
            .await
        {
            Ok(rollout) => {
                self.publisher.publish(DomainEvent::rollout_created(
                    &rollout.id,
                    &push.image,
                    &rollout.old_tag,
                    &push.tag,
                    plan.device_count(),
                ));
                Ok(IntakeOutcome::RolloutCreated(rollout))
            }
            Err(RolloutError::DuplicateRollout { rollout_id }) => {
                warn!(
                    image = %push.image,
                    tag = %push.tag,
                    rollout_id = %rollout_id,
                    "duplicate webhook for active rollout"
                );
                Ok(IntakeOutcome::DuplicateRollout(rollout_id))
            }
            Err(e) => Err(e),
        }
    }
}

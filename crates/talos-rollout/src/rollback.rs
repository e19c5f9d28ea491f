//! Rollback coordination: reverting target state on failure.
//!
//! All reverts go through the Target State Service, so rollback writes obey
//! the same versioning and no-op contracts as forward writes. A rollback
//! failure for one device marks that row `failed` and never aborts sibling
//! rollbacks.

use std::sync::Arc;

use futures::future::join_all;
use talos_core::{DeviceRolloutState, Rollout, RolloutStatus};
use talos_audit::{DomainEvent, EventPublisher};
use talos_store::TargetStateService;
use tracing::{info, warn};

use crate::error::{Result, RolloutError};
use crate::store::RolloutStore;

/// Configuration for the rollback coordinator.
#[derive(Debug, Clone)]
pub struct RollbackConfig {
    /// Maximum per-device rollbacks in flight at once.
    pub concurrency: usize,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self { concurrency: 10 }
    }
}

/// Reverts devices to a rollout's `old_tag`.
pub struct RollbackCoordinator {
    config: RollbackConfig,
    target_state: Arc<TargetStateService>,
    rollouts: Arc<RolloutStore>,
    publisher: Arc<EventPublisher>,
}

impl RollbackCoordinator {
    /// Creates a new coordinator.
    pub fn new(
        target_state: Arc<TargetStateService>,
        rollouts: Arc<RolloutStore>,
        publisher: Arc<EventPublisher>,
        config: RollbackConfig,
    ) -> Self {
        Self {
            config,
            target_state,
            rollouts,
            publisher,
        }
    }

    /// Reverts one device and transitions its row.
    ///
    /// Returns the resulting row state: `rolled_back` on success, `failed`
    /// when the revert write failed.
    pub async fn rollback_device(
        &self,
        rollout: &Rollout,
        device_uuid: &str,
    ) -> Result<DeviceRolloutState> {
        match self.revert_target(rollout, device_uuid).await {
            Ok(()) => {
                self.rollouts
                    .transition_row(
                        &rollout.id,
                        device_uuid,
                        DeviceRolloutState::RolledBack,
                        None,
                    )
                    .await?;
                info!(
                    rollout_id = %rollout.id,
                    device_uuid = %device_uuid,
                    restored_tag = %rollout.old_tag,
                    "device rolled back"
                );
                self.publisher.publish(DomainEvent::rollout_device_rolled_back(
                    &rollout.id,
                    device_uuid,
                    &rollout.old_tag,
                ));
                Ok(DeviceRolloutState::RolledBack)
            }
            Err(e) => {
                warn!(
                    rollout_id = %rollout.id,
                    device_uuid = %device_uuid,
                    error = %e,
                    "rollback write failed, marking row failed"
                );
                self.rollouts
                    .transition_row(
                        &rollout.id,
                        device_uuid,
                        DeviceRolloutState::Failed,
                        Some(format!("rollback failed: {e}")),
                    )
                    .await?;
                Ok(DeviceRolloutState::Failed)
            }
        }
    }

    /// Reverts a set of devices with bounded concurrency.
    ///
    /// Per-device failures are absorbed into row states; the batch always
    /// runs to completion.
    pub async fn rollback_devices(&self, rollout: &Rollout, device_uuids: &[String]) {
        for chunk in device_uuids.chunks(self.config.concurrency.max(1)) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|uuid| self.rollback_device(rollout, uuid))
                .collect();
            for (uuid, result) in chunk.iter().zip(join_all(futures).await) {
                if let Err(e) = result {
                    warn!(
                        rollout_id = %rollout.id,
                        device_uuid = %uuid,
                        error = %e,
                        "rollback bookkeeping failed"
                    );
                }
            }
        }
    }

    /// Reverts every row whose target state was mutated and transitions the
    /// rollout to `rolled_back`.
    pub async fn rollback_all(&self, rollout_id: &str) -> Result<Rollout> {
        let (rollout, rows) = self.rollouts.detail(rollout_id).await?;
        if !rollout.status.can_transition(RolloutStatus::RolledBack) {
            return Err(RolloutError::Core(talos_core::Error::InvalidTransition {
                from: rollout.status.as_str().to_string(),
                to: RolloutStatus::RolledBack.as_str().to_string(),
            }));
        }

        let targeted: Vec<String> = rows
            .iter()
            .filter(|r| {
                matches!(
                    r.state,
                    DeviceRolloutState::Scheduled
                        | DeviceRolloutState::Updated
                        | DeviceRolloutState::Unhealthy
                        | DeviceRolloutState::Healthy
                )
            })
            .map(|r| r.device_uuid.clone())
            .collect();

        info!(
            rollout_id = %rollout_id,
            devices = targeted.len(),
            "rolling back entire rollout"
        );
        self.rollback_devices(&rollout, &targeted).await;

        let rollout = self
            .rollouts
            .transition(rollout_id, RolloutStatus::RolledBack)
            .await?;
        Ok(rollout)
    }

    /// Writes `old_tag` back into every matching service on the device.
    async fn revert_target(&self, rollout: &Rollout, device_uuid: &str) -> Result<()> {
        let (doc, _) = self.target_state.get(device_uuid).await?;
        let paths: Vec<(u32, u32)> = doc
            .state
            .services_for_image(&rollout.image_name)
            .map(|(app_id, service)| (app_id, service.id))
            .collect();

        // Nothing referencing the image anymore is a successful no-op.
        for (app_id, service_id) in paths {
            self.target_state
                .set_image_for_service(device_uuid, app_id, service_id, &rollout.old_tag)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan_rollout;
    use talos_audit::MemorySink;
    use talos_core::{App, Device, RolloutStrategy, Service, TargetState, UpdatePolicy};

    struct Fixture {
        target_state: Arc<TargetStateService>,
        rollouts: Arc<RolloutStore>,
        coordinator: RollbackCoordinator,
        sink: Arc<MemorySink>,
        rollout: Rollout,
    }

    async fn fixture(n: usize) -> Fixture {
        let sink = Arc::new(MemorySink::new(128));
        let publisher = Arc::new(EventPublisher::builder().with_sink(sink.clone()).build());
        let target_state = Arc::new(TargetStateService::new(publisher.clone()));
        let rollouts = Arc::new(RolloutStore::new());

        let mut devices = Vec::new();
        for i in 0..n {
            let uuid = format!("dev-{i:02}");
            target_state
                .init_device(
                    uuid.clone(),
                    TargetState::new().with_app(
                        App::new(1002, "cache").with_service(
                            Service::new(1, "redis").with_image("redis:7-alpine"),
                        ),
                    ),
                )
                .await
                .unwrap();
            devices.push(Device::new(uuid, "sensor"));
        }

        let policy = UpdatePolicy::new("p1", "redis:*", RolloutStrategy::Staged);
        let documents = target_state.all().await;
        let plan = plan_rollout(&documents, &devices, &policy, "redis", "7.2-alpine").unwrap();
        let rollout = rollouts
            .create("redis", "7.2-alpine", policy, &plan)
            .await
            .unwrap();

        let coordinator = RollbackCoordinator::new(
            target_state.clone(),
            rollouts.clone(),
            publisher,
            RollbackConfig::default(),
        );

        Fixture {
            target_state,
            rollouts,
            coordinator,
            sink,
            rollout,
        }
    }

    /// Drives a row to the given state through legal transitions.
    async fn drive_row(rollouts: &RolloutStore, rollout_id: &str, uuid: &str, to: DeviceRolloutState) {
        let chain = match to {
            DeviceRolloutState::Scheduled => vec![DeviceRolloutState::Scheduled],
            DeviceRolloutState::Updated => {
                vec![DeviceRolloutState::Scheduled, DeviceRolloutState::Updated]
            }
            DeviceRolloutState::Unhealthy => vec![
                DeviceRolloutState::Scheduled,
                DeviceRolloutState::Updated,
                DeviceRolloutState::Unhealthy,
            ],
            DeviceRolloutState::Healthy => vec![
                DeviceRolloutState::Scheduled,
                DeviceRolloutState::Updated,
                DeviceRolloutState::Healthy,
            ],
            other => vec![other],
        };
        for state in chain {
            rollouts
                .transition_row(rollout_id, uuid, state, None)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_rollback_device_restores_old_tag() {
        let f = fixture(3).await;
        // Simulate a mutated, unhealthy device.
        f.target_state
            .set_image_for_service("dev-00", 1002, 1, "7.2-alpine")
            .await
            .unwrap();
        drive_row(&f.rollouts, &f.rollout.id, "dev-00", DeviceRolloutState::Unhealthy).await;

        let state = f
            .coordinator
            .rollback_device(&f.rollout, "dev-00")
            .await
            .unwrap();
        assert_eq!(state, DeviceRolloutState::RolledBack);

        let (doc, _) = f.target_state.get("dev-00").await.unwrap();
        let image = doc.state.apps[&1002].service(1).unwrap().image().unwrap();
        assert_eq!(image.tag, "7-alpine");

        let events = f.sink.events_of_type("rollout.device_rolled_back");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["device_uuid"], "dev-00");
    }

    #[tokio::test]
    async fn test_rollback_all_reverts_targeted_rows_only() {
        let f = fixture(7).await;
        f.rollouts
            .transition(&f.rollout.id, RolloutStatus::InProgress)
            .await
            .unwrap();

        // Batch 1 device converged and is healthy; two batch-2 devices are
        // scheduled/updated; the rest are still pending.
        for (uuid, state) in [
            ("dev-00", DeviceRolloutState::Healthy),
            ("dev-01", DeviceRolloutState::Scheduled),
            ("dev-02", DeviceRolloutState::Updated),
        ] {
            f.target_state
                .set_image_for_service(uuid, 1002, 1, "7.2-alpine")
                .await
                .unwrap();
            drive_row(&f.rollouts, &f.rollout.id, uuid, state).await;
        }

        let rollout = f.coordinator.rollback_all(&f.rollout.id).await.unwrap();
        assert_eq!(rollout.status, RolloutStatus::RolledBack);

        let (_, rows) = f.rollouts.detail(&f.rollout.id).await.unwrap();
        for row in &rows {
            match row.device_uuid.as_str() {
                "dev-00" | "dev-01" | "dev-02" => {
                    assert_eq!(row.state, DeviceRolloutState::RolledBack);
                }
                _ => assert_eq!(row.state, DeviceRolloutState::Pending),
            }
        }

        // Every reverted device is back on the old tag.
        for uuid in ["dev-00", "dev-01", "dev-02"] {
            let (doc, _) = f.target_state.get(uuid).await.unwrap();
            let image = doc.state.apps[&1002].service(1).unwrap().image().unwrap();
            assert_eq!(image.tag, "7-alpine");
        }
    }

    #[tokio::test]
    async fn test_rollback_all_rejected_for_terminal_rollout() {
        let f = fixture(3).await;
        f.rollouts
            .transition(&f.rollout.id, RolloutStatus::Cancelled)
            .await
            .unwrap();

        let err = f.coordinator.rollback_all(&f.rollout.id).await.unwrap_err();
        assert!(matches!(err, RolloutError::Core(_)));
    }

    #[tokio::test]
    async fn test_rollback_failure_marks_row_failed() {
        let f = fixture(3).await;
        drive_row(&f.rollouts, &f.rollout.id, "dev-00", DeviceRolloutState::Unhealthy).await;

        // Break the revert: the device was deprovisioned mid-rollout.
        f.target_state.remove_device("dev-00").await.unwrap();

        let state = f
            .coordinator
            .rollback_device(&f.rollout, "dev-00")
            .await
            .unwrap();
        assert_eq!(state, DeviceRolloutState::Failed);

        let (_, rows) = f.rollouts.detail(&f.rollout.id).await.unwrap();
        let row = rows.iter().find(|r| r.device_uuid == "dev-00").unwrap();
        assert!(row.error.as_deref().unwrap().contains("rollback failed"));
    }
}

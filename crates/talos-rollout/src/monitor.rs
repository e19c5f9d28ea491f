//! The rollout monitor: the periodic driver of the control loop.
//!
//! One monitor instance runs per deployment. Each tick it scans driveable
//! rollouts and, per rollout: auto-starts pending ones, fails out
//! convergence-timeout rows, runs health checks on converged rows, applies
//! auto-rollback and the failure-rate guard, advances batches after their
//! dwell time, and completes finished rollouts. An error while driving one
//! rollout never affects the others.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use talos_audit::{DomainEvent, EventPublisher};
use talos_core::{
    DeviceRollout, DeviceRolloutState, Rollout, RolloutStatus, RolloutStrategy,
};
use talos_store::{CurrentStateStore, DeviceStore, TargetStateService};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Result, RolloutError};
use crate::health::{HealthEvaluator, HealthTarget};
use crate::rollback::RollbackCoordinator;
use crate::store::RolloutStore;

/// Configuration for the rollout monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Tick period.
    pub tick_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
        }
    }
}

/// The periodic rollout driver.
pub struct RolloutMonitor {
    config: MonitorConfig,
    rollouts: Arc<RolloutStore>,
    target_state: Arc<TargetStateService>,
    devices: Arc<DeviceStore>,
    current_state: Arc<CurrentStateStore>,
    evaluator: HealthEvaluator,
    rollback: Arc<RollbackCoordinator>,
    publisher: Arc<EventPublisher>,
}

impl RolloutMonitor {
    /// Creates a new monitor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MonitorConfig,
        rollouts: Arc<RolloutStore>,
        target_state: Arc<TargetStateService>,
        devices: Arc<DeviceStore>,
        current_state: Arc<CurrentStateStore>,
        evaluator: HealthEvaluator,
        rollback: Arc<RollbackCoordinator>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            config,
            rollouts,
            target_state,
            devices,
            current_state,
            evaluator,
            rollback,
            publisher,
        }
    }

    /// Runs the tick loop until shutdown is signalled.
    ///
    /// On shutdown the current tick finishes, then the loop exits; no new
    /// ticks begin.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            "rollout monitor started"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("rollout monitor stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One monitor pass over all driveable rollouts.
    ///
    /// Idempotent: with no external input, a second consecutive tick makes
    /// no further state changes.
    pub async fn tick(&self) {
        let driveable = self.rollouts.list_driveable().await;
        for rollout in driveable {
            if let Err(e) = self.drive(&rollout.id).await {
                match &e {
                    RolloutError::RolloutNotFound { .. } | RolloutError::RowNotFound { .. } => {
                        error!(rollout_id = %rollout.id, error = %e, "rollout state inconsistent, failing rollout");
                        if let Err(fail_err) = self.rollouts.fail(&rollout.id, &e.to_string()).await
                        {
                            error!(rollout_id = %rollout.id, error = %fail_err, "could not fail rollout");
                        } else {
                            self.publisher
                                .publish(DomainEvent::rollout_failed(&rollout.id, &e.to_string()));
                        }
                    }
                    _ => {
                        // Transient; the next tick retries.
                        warn!(rollout_id = %rollout.id, error = %e, "rollout tick failed");
                    }
                }
            }
        }
    }

    /// Drives one rollout through one tick.
    async fn drive(&self, rollout_id: &str) -> Result<()> {
        let rollout = self.rollouts.get(rollout_id).await?;
        match rollout.status {
            RolloutStatus::Pending => {
                if self.should_auto_start(&rollout) {
                    self.start(rollout_id).await?;
                }
                Ok(())
            }
            RolloutStatus::InProgress => self.drive_batch(&rollout).await,
            _ => Ok(()),
        }
    }

    fn should_auto_start(&self, rollout: &Rollout) -> bool {
        match rollout.strategy {
            RolloutStrategy::Auto | RolloutStrategy::Staged => true,
            RolloutStrategy::Scheduled => rollout
                .start_after
                .is_none_or(|after| Utc::now() >= after),
            RolloutStrategy::Manual => false,
        }
    }

    // Admin operations -------------------------------------------------------

    /// Starts a pending rollout and activates batch 1.
    ///
    /// Used by the monitor for auto-starting strategies and by the admin
    /// surface for `manual`/`scheduled` rollouts.
    pub async fn start(&self, rollout_id: &str) -> Result<Rollout> {
        let current = self.rollouts.get(rollout_id).await?;
        if current.status != RolloutStatus::Pending {
            return Err(RolloutError::Core(talos_core::Error::InvalidTransition {
                from: current.status.as_str().to_string(),
                to: "started".to_string(),
            }));
        }
        let rollout = self
            .rollouts
            .transition(rollout_id, RolloutStatus::InProgress)
            .await?;
        info!(rollout_id = %rollout_id, strategy = %rollout.strategy, "rollout started");
        self.activate_batch(&rollout, 1).await?;
        self.rollouts.get(rollout_id).await
    }

    /// Advances a `manual` rollout to its next batch.
    pub async fn advance(&self, rollout_id: &str) -> Result<Rollout> {
        let rollout = self.rollouts.get(rollout_id).await?;
        if rollout.status != RolloutStatus::InProgress {
            return Err(RolloutError::Core(talos_core::Error::InvalidTransition {
                from: rollout.status.as_str().to_string(),
                to: "next batch".to_string(),
            }));
        }
        let rows = self
            .rollouts
            .batch_rows(rollout_id, rollout.current_batch)
            .await?;
        if !rows.iter().all(|r| r.state.is_terminal()) {
            return Err(RolloutError::BatchNotComplete {
                rollout_id: rollout_id.to_string(),
                batch: rollout.current_batch,
            });
        }
        if rollout.current_batch >= rollout.total_batches {
            return Err(RolloutError::BatchNotComplete {
                rollout_id: rollout_id.to_string(),
                batch: rollout.current_batch,
            });
        }
        self.activate_batch(&rollout, rollout.current_batch + 1)
            .await?;
        self.rollouts.get(rollout_id).await
    }

    /// Pauses an in-progress rollout.
    pub async fn pause(&self, rollout_id: &str, reason: &str) -> Result<Rollout> {
        let rollout = self
            .rollouts
            .transition(rollout_id, RolloutStatus::Paused)
            .await?;
        info!(rollout_id = %rollout_id, reason = %reason, "rollout paused");
        Ok(rollout)
    }

    /// Resumes a paused rollout. Resuming anything else is invalid.
    pub async fn resume(&self, rollout_id: &str) -> Result<Rollout> {
        let current = self.rollouts.get(rollout_id).await?;
        if current.status != RolloutStatus::Paused {
            return Err(RolloutError::Core(talos_core::Error::InvalidTransition {
                from: current.status.as_str().to_string(),
                to: RolloutStatus::InProgress.as_str().to_string(),
            }));
        }
        let rollout = self
            .rollouts
            .transition(rollout_id, RolloutStatus::InProgress)
            .await?;
        info!(rollout_id = %rollout_id, "rollout resumed");
        Ok(rollout)
    }

    /// Cancels a rollout. Already-scheduled devices keep the new tag.
    pub async fn cancel(&self, rollout_id: &str, reason: &str) -> Result<Rollout> {
        let rollout = self
            .rollouts
            .transition(rollout_id, RolloutStatus::Cancelled)
            .await?;
        info!(rollout_id = %rollout_id, reason = %reason, "rollout cancelled");
        Ok(rollout)
    }

    /// Rolls back the whole rollout.
    pub async fn rollback_all(&self, rollout_id: &str) -> Result<Rollout> {
        self.rollback.rollback_all(rollout_id).await
    }

    /// Rolls back a single device within a rollout.
    pub async fn rollback_device(
        &self,
        rollout_id: &str,
        device_uuid: &str,
    ) -> Result<DeviceRolloutState> {
        let rollout = self.rollouts.get(rollout_id).await?;
        self.rollback.rollback_device(&rollout, device_uuid).await
    }

    // Batch driving ----------------------------------------------------------

    /// Writes the new tag to every pending row of the batch and marks the
    /// rows `scheduled`.
    async fn activate_batch(&self, rollout: &Rollout, batch: u32) -> Result<()> {
        self.rollouts.begin_batch(&rollout.id, batch).await?;
        let rows = self.rollouts.batch_rows(&rollout.id, batch).await?;

        let mut activated = 0usize;
        for row in rows
            .iter()
            .filter(|r| r.state == DeviceRolloutState::Pending)
        {
            match self.schedule_device(rollout, &row.device_uuid).await {
                Ok(()) => {
                    self.rollouts
                        .transition_row(
                            &rollout.id,
                            &row.device_uuid,
                            DeviceRolloutState::Scheduled,
                            None,
                        )
                        .await?;
                    activated += 1;
                }
                Err(RolloutError::Store(e @ talos_store::StoreError::VersionConflict { .. })) => {
                    // Leave the row pending; the next tick retries it.
                    warn!(
                        rollout_id = %rollout.id,
                        device_uuid = %row.device_uuid,
                        error = %e,
                        "batch activation hit a version conflict"
                    );
                }
                Err(e) => {
                    // The device no longer carries a matching service.
                    warn!(
                        rollout_id = %rollout.id,
                        device_uuid = %row.device_uuid,
                        error = %e,
                        "device not updatable, skipping row"
                    );
                    self.rollouts
                        .transition_row(
                            &rollout.id,
                            &row.device_uuid,
                            DeviceRolloutState::Skipped,
                            Some(e.to_string()),
                        )
                        .await?;
                }
            }
        }

        info!(
            rollout_id = %rollout.id,
            batch = batch,
            devices = activated,
            "batch activated"
        );
        self.publisher
            .publish(DomainEvent::rollout_batch_started(&rollout.id, batch, activated));
        Ok(())
    }

    /// Writes the rollout's new tag into every matching service on one
    /// device.
    async fn schedule_device(&self, rollout: &Rollout, device_uuid: &str) -> Result<()> {
        let (doc, _) = self.target_state.get(device_uuid).await?;
        let paths: Vec<(u32, u32)> = doc
            .state
            .services_for_image(&rollout.image_name)
            .map(|(app_id, service)| (app_id, service.id))
            .collect();
        if paths.is_empty() {
            return Err(RolloutError::Core(talos_core::Error::ServicePathNotFound {
                app_id: 0,
                service_id: 0,
            }));
        }
        for (app_id, service_id) in paths {
            self.target_state
                .set_image_for_service(device_uuid, app_id, service_id, &rollout.new_tag)
                .await?;
        }
        Ok(())
    }

    /// Drives the current batch of an in-progress rollout.
    async fn drive_batch(&self, rollout: &Rollout) -> Result<()> {
        // A rollout resumed or started out-of-band may not have an active
        // batch yet.
        if rollout.current_batch == 0 {
            return self.activate_batch(rollout, 1).await;
        }

        self.fail_convergence_timeouts(rollout).await?;
        self.run_health_checks(rollout).await?;

        let rows = self
            .rollouts
            .batch_rows(&rollout.id, rollout.current_batch)
            .await?;
        if !rows.iter().all(|r| r.state.is_terminal()) {
            debug!(
                rollout_id = %rollout.id,
                batch = rollout.current_batch,
                "batch still converging"
            );
            return Ok(());
        }

        // Failure-rate guard, strict `>`. A resume after a guard pause
        // acknowledges the current batch's failures, so the guard skips the
        // batch it already fired on.
        let processed = self.rollouts.processed_count(&rollout.id).await?;
        let refreshed = self.rollouts.get(&rollout.id).await?;
        let rate = refreshed.failure_rate(processed);
        if rate > refreshed.policy.max_failure_rate
            && refreshed.guard_fired_batch != Some(rollout.current_batch)
        {
            warn!(
                rollout_id = %rollout.id,
                failure_rate = rate,
                max = refreshed.policy.max_failure_rate,
                "failure rate exceeded, pausing rollout"
            );
            self.rollouts
                .pause_for_failure_rate(&rollout.id, rollout.current_batch)
                .await?;
            self.publisher
                .publish(DomainEvent::rollout_paused(&rollout.id, rate));
            return Ok(());
        }

        if rollout.current_batch < rollout.total_batches {
            if refreshed.strategy == RolloutStrategy::Manual {
                return Ok(());
            }
            let dwell_over = refreshed.last_batch_started_at.is_none_or(|started| {
                let elapsed = Utc::now() - started;
                elapsed.to_std().unwrap_or_default() >= refreshed.policy.batch_delay()
            });
            if dwell_over {
                self.activate_batch(&refreshed, rollout.current_batch + 1)
                    .await?;
            }
            return Ok(());
        }

        let rollout = self
            .rollouts
            .transition(&rollout.id, RolloutStatus::Completed)
            .await?;
        info!(
            rollout_id = %rollout.id,
            healthy = rollout.counters.healthy,
            "rollout completed"
        );
        self.publisher.publish(DomainEvent::rollout_completed(
            &rollout.id,
            rollout.counters.healthy,
        ));
        Ok(())
    }

    /// Fails `scheduled` rows that exceeded the convergence timeout.
    async fn fail_convergence_timeouts(&self, rollout: &Rollout) -> Result<()> {
        let timeout = rollout.policy.convergence_timeout();
        let rows = self
            .rollouts
            .batch_rows(&rollout.id, rollout.current_batch)
            .await?;

        for row in rows
            .iter()
            .filter(|r| r.state == DeviceRolloutState::Scheduled)
        {
            let timed_out = row.scheduled_at.is_some_and(|at| {
                (Utc::now() - at).to_std().unwrap_or_default() >= timeout
            });
            if !timed_out {
                continue;
            }
            warn!(
                rollout_id = %rollout.id,
                device_uuid = %row.device_uuid,
                "device did not converge within the timeout"
            );
            self.rollouts
                .transition_row(
                    &rollout.id,
                    &row.device_uuid,
                    DeviceRolloutState::Failed,
                    Some("convergence timeout exceeded".to_string()),
                )
                .await?;
            if rollout.policy.auto_rollback {
                // Failed → rolled_back via a restored prior tag.
                self.rollback
                    .rollback_device(rollout, &row.device_uuid)
                    .await?;
            }
        }
        Ok(())
    }

    /// Runs the policy's health probe for `updated` rows without a check
    /// result, then applies auto-rollback to unhealthy rows.
    async fn run_health_checks(&self, rollout: &Rollout) -> Result<()> {
        let rows = self
            .rollouts
            .batch_rows(&rollout.id, rollout.current_batch)
            .await?;
        let unchecked: Vec<&DeviceRollout> = rows
            .iter()
            .filter(|r| r.state == DeviceRolloutState::Updated && r.health_checked_at.is_none())
            .collect();
        if unchecked.is_empty() {
            return Ok(());
        }

        if rollout.policy.health_check.is_disabled() {
            for row in unchecked {
                self.rollouts
                    .transition_row(
                        &rollout.id,
                        &row.device_uuid,
                        DeviceRolloutState::Healthy,
                        None,
                    )
                    .await?;
            }
            return Ok(());
        }

        let mut targets = Vec::with_capacity(unchecked.len());
        for row in &unchecked {
            let device = self.devices.get(&row.device_uuid).await?;
            let current_state = self.current_state.get(&row.device_uuid).await;
            targets.push(HealthTarget {
                device,
                current_state,
            });
        }

        let outcomes = self
            .evaluator
            .evaluate(
                &rollout.policy.health_check,
                &rollout.image_name,
                &rollout.new_tag,
                &targets,
            )
            .await;

        let mut unhealthy = Vec::new();
        for (device_uuid, outcome) in outcomes {
            let passed = outcome.is_pass();
            let to = if passed {
                DeviceRolloutState::Healthy
            } else {
                DeviceRolloutState::Unhealthy
            };
            self.rollouts
                .transition_row(&rollout.id, &device_uuid, to, outcome.detail())
                .await?;
            self.publisher.publish(DomainEvent::health_check_result(
                &rollout.id,
                &device_uuid,
                passed,
                outcome.detail().as_deref(),
            ));
            if !passed {
                unhealthy.push(device_uuid);
            }
        }

        if rollout.policy.auto_rollback && !unhealthy.is_empty() {
            self.rollback.rollback_devices(rollout, &unhealthy).await;
        }
        Ok(())
    }
}

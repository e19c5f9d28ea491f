//! Durable rollout representation: plan, per-device rows, batch cursor,
//! counters, and the status machine.
//!
//! The store owns every transition. Aggregate counters are recomputed from
//! the rows after each row transition, so they are always exact bucket
//! counts.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use talos_core::{
    CurrentStateReport, DeviceRollout, DeviceRolloutState, DeviceUuid, Rollout, RolloutCounters,
    RolloutId, RolloutStatus, UpdatePolicy,
};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::{Timestamp, Uuid};

use crate::error::{Result, RolloutError};
use crate::planner::RolloutPlan;

/// A rollout and its rows.
#[derive(Debug, Clone)]
struct RolloutRecord {
    rollout: Rollout,
    rows: BTreeMap<DeviceUuid, DeviceRollout>,
}

impl RolloutRecord {
    fn refresh_counters(&mut self) {
        self.rollout.counters = RolloutCounters::from_rows(self.rows.values());
    }
}

/// Store of rollouts and their device rows.
#[derive(Debug, Default)]
pub struct RolloutStore {
    rollouts: RwLock<HashMap<RolloutId, RolloutRecord>>,
}

impl RolloutStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists a planned rollout with status `pending`.
    ///
    /// At most one active rollout may exist per image: a duplicate push of
    /// the same `(image, new_tag)` surfaces the existing rollout id, any
    /// other tag is refused until the active rollout finishes.
    pub async fn create(
        &self,
        image_name: &str,
        new_tag: &str,
        policy: UpdatePolicy,
        plan: &RolloutPlan,
    ) -> Result<Rollout> {
        let mut rollouts = self.rollouts.write().await;

        if let Some(existing) = rollouts
            .values()
            .map(|r| &r.rollout)
            .find(|r| r.image_name == image_name && r.status.is_active())
        {
            if existing.new_tag == new_tag {
                return Err(RolloutError::DuplicateRollout {
                    rollout_id: existing.id.clone(),
                });
            }
            return Err(RolloutError::ImageLocked {
                rollout_id: existing.id.clone(),
            });
        }

        let id = Uuid::new_v7(Timestamp::now(uuid::NoContext)).to_string();
        let rollout = Rollout::new(
            id.clone(),
            image_name,
            plan.old_tag.clone(),
            new_tag,
            policy,
            plan.total_batches,
        );

        let rows: BTreeMap<DeviceUuid, DeviceRollout> = plan
            .rows
            .iter()
            .map(|row| (row.device_uuid.clone(), row.clone()))
            .collect();

        info!(
            rollout_id = %id,
            image = %image_name,
            old_tag = %plan.old_tag,
            new_tag = %new_tag,
            devices = rows.len(),
            batches = plan.total_batches,
            "rollout created"
        );

        rollouts.insert(
            id,
            RolloutRecord {
                rollout: rollout.clone(),
                rows,
            },
        );
        Ok(rollout)
    }

    /// Fetches a rollout by id.
    pub async fn get(&self, rollout_id: &str) -> Result<Rollout> {
        let rollouts = self.rollouts.read().await;
        rollouts
            .get(rollout_id)
            .map(|r| r.rollout.clone())
            .ok_or_else(|| RolloutError::RolloutNotFound {
                rollout_id: rollout_id.to_string(),
            })
    }

    /// Fetches a rollout together with its rows, batch-then-uuid ordered.
    pub async fn detail(&self, rollout_id: &str) -> Result<(Rollout, Vec<DeviceRollout>)> {
        let rollouts = self.rollouts.read().await;
        let record = rollouts
            .get(rollout_id)
            .ok_or_else(|| RolloutError::RolloutNotFound {
                rollout_id: rollout_id.to_string(),
            })?;
        let mut rows: Vec<DeviceRollout> = record.rows.values().cloned().collect();
        rows.sort_by(|a, b| {
            (a.batch_number, a.device_uuid.as_str()).cmp(&(b.batch_number, b.device_uuid.as_str()))
        });
        Ok((record.rollout.clone(), rows))
    }

    /// Lists all rollouts, newest first.
    pub async fn list(&self) -> Vec<Rollout> {
        let rollouts = self.rollouts.read().await;
        let mut all: Vec<Rollout> = rollouts.values().map(|r| r.rollout.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Lists rollouts the monitor should look at: `pending` and
    /// `in_progress`.
    pub async fn list_driveable(&self) -> Vec<Rollout> {
        let rollouts = self.rollouts.read().await;
        let mut all: Vec<Rollout> = rollouts
            .values()
            .map(|r| r.rollout.clone())
            .filter(|r| {
                matches!(
                    r.status,
                    RolloutStatus::Pending | RolloutStatus::InProgress
                )
            })
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Transitions a rollout, validating against the status machine.
    pub async fn transition(&self, rollout_id: &str, to: RolloutStatus) -> Result<Rollout> {
        let mut rollouts = self.rollouts.write().await;
        let record = rollouts
            .get_mut(rollout_id)
            .ok_or_else(|| RolloutError::RolloutNotFound {
                rollout_id: rollout_id.to_string(),
            })?;
        record.rollout.transition(to)?;
        Ok(record.rollout.clone())
    }

    /// Transitions a rollout to `failed` with a reason.
    pub async fn fail(&self, rollout_id: &str, reason: &str) -> Result<()> {
        let mut rollouts = self.rollouts.write().await;
        let record = rollouts
            .get_mut(rollout_id)
            .ok_or_else(|| RolloutError::RolloutNotFound {
                rollout_id: rollout_id.to_string(),
            })?;
        record.rollout.transition(RolloutStatus::Failed)?;
        record.rollout.error = Some(reason.to_string());
        Ok(())
    }

    /// Pauses a rollout because its failure rate exceeded the policy
    /// maximum, recording the batch the guard fired on so a resume is not
    /// immediately re-paused for the same failures.
    pub async fn pause_for_failure_rate(&self, rollout_id: &str, batch: u32) -> Result<Rollout> {
        let mut rollouts = self.rollouts.write().await;
        let record = rollouts
            .get_mut(rollout_id)
            .ok_or_else(|| RolloutError::RolloutNotFound {
                rollout_id: rollout_id.to_string(),
            })?;
        record.rollout.transition(RolloutStatus::Paused)?;
        record.rollout.guard_fired_batch = Some(batch);
        Ok(record.rollout.clone())
    }

    /// Moves the batch cursor and stamps `last_batch_started_at`.
    pub async fn begin_batch(&self, rollout_id: &str, batch: u32) -> Result<()> {
        let mut rollouts = self.rollouts.write().await;
        let record = rollouts
            .get_mut(rollout_id)
            .ok_or_else(|| RolloutError::RolloutNotFound {
                rollout_id: rollout_id.to_string(),
            })?;
        record.rollout.current_batch = batch;
        record.rollout.last_batch_started_at = Some(Utc::now());
        Ok(())
    }

    /// Transitions one device row, refreshing the aggregate counters.
    pub async fn transition_row(
        &self,
        rollout_id: &str,
        device_uuid: &str,
        to: DeviceRolloutState,
        error: Option<String>,
    ) -> Result<DeviceRollout> {
        let mut rollouts = self.rollouts.write().await;
        let record = rollouts
            .get_mut(rollout_id)
            .ok_or_else(|| RolloutError::RolloutNotFound {
                rollout_id: rollout_id.to_string(),
            })?;
        let row = record
            .rows
            .get_mut(device_uuid)
            .ok_or_else(|| RolloutError::RowNotFound {
                rollout_id: rollout_id.to_string(),
                device_uuid: device_uuid.to_string(),
            })?;
        row.transition(to)?;
        if error.is_some() {
            row.error = error;
        }
        let row = row.clone();
        record.refresh_counters();
        Ok(row)
    }

    /// Rows of one batch, uuid-sorted.
    pub async fn batch_rows(&self, rollout_id: &str, batch: u32) -> Result<Vec<DeviceRollout>> {
        let rollouts = self.rollouts.read().await;
        let record = rollouts
            .get(rollout_id)
            .ok_or_else(|| RolloutError::RolloutNotFound {
                rollout_id: rollout_id.to_string(),
            })?;
        Ok(record
            .rows
            .values()
            .filter(|r| r.batch_number == batch)
            .cloned()
            .collect())
    }

    /// Number of devices in batches activated so far (the failure-rate
    /// denominator).
    pub async fn processed_count(&self, rollout_id: &str) -> Result<usize> {
        let rollouts = self.rollouts.read().await;
        let record = rollouts
            .get(rollout_id)
            .ok_or_else(|| RolloutError::RolloutNotFound {
                rollout_id: rollout_id.to_string(),
            })?;
        let current = record.rollout.current_batch;
        Ok(record
            .rows
            .values()
            .filter(|r| r.batch_number <= current)
            .count())
    }

    /// Applies a device's current-state report to every active rollout it
    /// participates in: a `scheduled` row in the active batch whose
    /// reported tag equals the rollout's `new_tag` becomes `updated`.
    ///
    /// The transition is an idempotent CAS: replaying the report finds the
    /// row already `updated` and does nothing.
    pub async fn record_device_report(
        &self,
        device_uuid: &str,
        report: &CurrentStateReport,
    ) -> Vec<RolloutId> {
        let mut converged = Vec::new();
        let mut rollouts = self.rollouts.write().await;
        for record in rollouts.values_mut() {
            if record.rollout.status != RolloutStatus::InProgress {
                continue;
            }
            let current_batch = record.rollout.current_batch;
            let image = record.rollout.image_name.clone();
            let new_tag = record.rollout.new_tag.clone();

            let Some(row) = record.rows.get_mut(device_uuid) else {
                continue;
            };
            if row.state != DeviceRolloutState::Scheduled || row.batch_number != current_batch {
                continue;
            }
            if !report.reports_image(&image, &new_tag) {
                continue;
            }
            // Transition is legal by construction; ignore the impossible error.
            if row.transition(DeviceRolloutState::Updated).is_ok() {
                debug!(
                    rollout_id = %record.rollout.id,
                    device_uuid = %device_uuid,
                    "device reported new tag, row updated"
                );
                converged.push(record.rollout.id.clone());
                record.refresh_counters();
            }
        }
        converged
    }
}

//! Rollout and device-row state machines.
//!
//! A rollout is a planned, batched migration of a fleet from `old_tag` to
//! `new_tag` for one image. The rollout itself and each of its per-device
//! rows carry small state machines; every transition is validated here so
//! stores cannot drift into impossible states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceUuid;
use crate::error::{Error, Result};
use crate::policy::{RolloutStrategy, UpdatePolicy};

/// Unique identifier for a rollout.
pub type RolloutId = String;

/// Aggregate status of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    /// Planned but not yet started.
    Pending,

    /// Batches are being driven.
    InProgress,

    /// Stopped by the failure-rate guard or an admin; resumable.
    Paused,

    /// Every row reached a terminal state and the fleet converged.
    Completed,

    /// Unrecoverable error.
    Failed,

    /// Cancelled by an admin.
    Cancelled,

    /// Reverted wholesale to `old_tag`.
    RolledBack,
}

impl RolloutStatus {
    /// Returns true if no further transitions are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::RolledBack
        )
    }

    /// Returns true if the rollout still claims its devices (a device may
    /// appear in at most one active rollout per image).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress | Self::Paused)
    }

    /// Returns a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Returns true if the state machine permits the transition.
    pub fn can_transition(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::InProgress | Self::Cancelled)
                | (
                    Self::InProgress,
                    Self::Paused
                        | Self::Cancelled
                        | Self::RolledBack
                        | Self::Completed
                        | Self::Failed
                )
                | (Self::Paused, Self::InProgress | Self::Cancelled | Self::RolledBack)
        )
    }
}

impl std::fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-device progress within a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRolloutState {
    /// Waiting for its batch to activate.
    Pending,

    /// New tag written to the device's target state; awaiting convergence.
    Scheduled,

    /// Device reported the new tag running.
    Updated,

    /// Health check passed.
    Healthy,

    /// Health check failed or timed out.
    Unhealthy,

    /// Convergence or rollback failed.
    Failed,

    /// Reverted to the previous tag.
    RolledBack,

    /// Excluded from the rollout after planning.
    Skipped,
}

impl DeviceRolloutState {
    /// Returns true if no further transitions are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Healthy | Self::RolledBack | Self::Failed | Self::Skipped
        )
    }

    /// Returns a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Updated => "updated",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::Skipped => "skipped",
        }
    }

    /// Returns true if the row state machine permits the transition.
    ///
    /// `updated`/`healthy` → `rolled_back`/`failed` only occur under a
    /// whole-rollout rollback, which reverts every row whose target state
    /// was already mutated.
    pub fn can_transition(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Scheduled | Self::Skipped)
                | (Self::Scheduled, Self::Updated | Self::Failed | Self::RolledBack)
                | (Self::Updated, Self::Healthy | Self::Unhealthy | Self::RolledBack | Self::Failed)
                | (Self::Unhealthy, Self::RolledBack | Self::Failed)
                | (Self::Healthy, Self::RolledBack | Self::Failed)
                | (Self::Failed, Self::RolledBack)
        )
    }
}

impl std::fmt::Display for DeviceRolloutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One device's row in a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRollout {
    /// The device this row tracks.
    pub device_uuid: DeviceUuid,

    /// 1-indexed batch assignment.
    pub batch_number: u32,

    /// Current row state.
    pub state: DeviceRolloutState,

    /// When the new tag was written to the device's target state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,

    /// When the device reported the new tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// When the health check concluded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_checked_at: Option<DateTime<Utc>>,

    /// Error detail for failed/unhealthy rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeviceRollout {
    /// Creates a pending row in the given batch.
    pub fn new(device_uuid: impl Into<String>, batch_number: u32) -> Self {
        Self {
            device_uuid: device_uuid.into(),
            batch_number,
            state: DeviceRolloutState::Pending,
            scheduled_at: None,
            updated_at: None,
            health_checked_at: None,
            error: None,
        }
    }

    /// Transitions the row, validating against the state machine and
    /// stamping the matching timestamp.
    pub fn transition(&mut self, to: DeviceRolloutState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: self.state.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        let now = Utc::now();
        match to {
            DeviceRolloutState::Scheduled => self.scheduled_at = Some(now),
            DeviceRolloutState::Updated => self.updated_at = Some(now),
            DeviceRolloutState::Healthy | DeviceRolloutState::Unhealthy => {
                self.health_checked_at = Some(now);
            }
            _ => {}
        }
        self.state = to;
        Ok(())
    }
}

/// Aggregate bucket counts over a rollout's rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutCounters {
    /// Rows currently `scheduled`.
    pub scheduled: usize,

    /// Rows currently `updated`.
    pub updated: usize,

    /// Rows that passed their health check.
    pub healthy: usize,

    /// Rows that failed their health check.
    pub unhealthy: usize,

    /// Rows that failed.
    pub failed: usize,

    /// Rows reverted to the previous tag.
    pub rolled_back: usize,
}

impl RolloutCounters {
    /// Recomputes counters from row states.
    pub fn from_rows<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = &'a DeviceRollout>,
    {
        let mut counters = Self::default();
        for row in rows {
            match row.state {
                DeviceRolloutState::Scheduled => counters.scheduled += 1,
                DeviceRolloutState::Updated => counters.updated += 1,
                DeviceRolloutState::Healthy => counters.healthy += 1,
                DeviceRolloutState::Unhealthy => counters.unhealthy += 1,
                DeviceRolloutState::Failed => counters.failed += 1,
                DeviceRolloutState::RolledBack => counters.rolled_back += 1,
                DeviceRolloutState::Pending | DeviceRolloutState::Skipped => {}
            }
        }
        counters
    }
}

/// A planned, batched fleet migration for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    /// Rollout identifier.
    pub id: RolloutId,

    /// Image being migrated.
    pub image_name: String,

    /// Tag the fleet is migrating away from (rollback target).
    pub old_tag: String,

    /// Tag the fleet is migrating to.
    pub new_tag: String,

    /// Strategy the plan was built with.
    pub strategy: RolloutStrategy,

    /// Number of batches after elision.
    pub total_batches: u32,

    /// 1-indexed batch currently being driven.
    pub current_batch: u32,

    /// Aggregate status.
    pub status: RolloutStatus,

    /// Derived bucket counts, refreshed after every row transition.
    pub counters: RolloutCounters,

    /// Policy snapshot taken at plan time.
    pub policy: UpdatePolicy,

    /// When the rollout was planned.
    pub created_at: DateTime<Utc>,

    /// Earliest start for `scheduled` rollouts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_after: Option<DateTime<Utc>>,

    /// Batch the failure-rate guard last fired on. A resume after a guard
    /// pause acknowledges that batch's failures; the guard only fires again
    /// once the cursor moves on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard_fired_batch: Option<u32>,

    /// When the first batch was activated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the current batch was activated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_batch_started_at: Option<DateTime<Utc>>,

    /// When a terminal status was reached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Failure detail for `failed` rollouts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Rollout {
    /// Creates a pending rollout.
    pub fn new(
        id: impl Into<String>,
        image_name: impl Into<String>,
        old_tag: impl Into<String>,
        new_tag: impl Into<String>,
        policy: UpdatePolicy,
        total_batches: u32,
    ) -> Self {
        let created_at = Utc::now();
        let start_after = match policy.strategy {
            RolloutStrategy::Scheduled => Some(
                created_at
                    + chrono::Duration::seconds(
                        i64::try_from(policy.start_delay_seconds).unwrap_or(i64::MAX),
                    ),
            ),
            _ => None,
        };
        Self {
            id: id.into(),
            image_name: image_name.into(),
            old_tag: old_tag.into(),
            new_tag: new_tag.into(),
            strategy: policy.strategy,
            total_batches,
            current_batch: 0,
            status: RolloutStatus::Pending,
            counters: RolloutCounters::default(),
            policy,
            created_at,
            start_after,
            guard_fired_batch: None,
            started_at: None,
            last_batch_started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Transitions the rollout, validating against the state machine and
    /// stamping the matching timestamps.
    pub fn transition(&mut self, to: RolloutStatus) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        let now = Utc::now();
        match to {
            RolloutStatus::InProgress if self.started_at.is_none() => {
                self.started_at = Some(now);
            }
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Failure rate over the given number of processed devices:
    /// `(failed + rolled_back) / processed`.
    pub fn failure_rate(&self, processed: usize) -> f64 {
        if processed == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            (self.counters.failed + self.counters.rolled_back) as f64 / processed as f64
        }
    }
}

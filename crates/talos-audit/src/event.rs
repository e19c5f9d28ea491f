//! Domain event definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::{Timestamp, Uuid};

/// Generates a new v7 UUID for domain events.
fn new_event_id() -> Uuid {
    let ts = Timestamp::now(uuid::NoContext);
    Uuid::new_v7(ts)
}

/// The aggregate a domain event belongs to.
///
/// Ordering within one aggregate is authoritative; across aggregates it is
/// best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    /// A provisioned device.
    Device,
    /// A rollout and its rows.
    Rollout,
    /// An image registry entry.
    Image,
}

impl AggregateType {
    /// Returns a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Rollout => "rollout",
            Self::Image => "image",
        }
    }
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An append-only domain event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique event ID (UUID v7, time-ordered).
    pub event_id: Uuid,

    /// Event type, e.g. `rollout.batch_started`.
    pub event_type: String,

    /// Aggregate this event belongs to.
    pub aggregate_type: AggregateType,

    /// Identifier of the aggregate instance.
    pub aggregate_id: String,

    /// Opaque event payload.
    pub data: Value,

    /// When the event occurred.
    pub timestamp: DateTime<Utc>,

    /// Component that emitted the event.
    pub source: String,
}

impl DomainEvent {
    /// Creates an event with an arbitrary type and payload.
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: AggregateType,
        aggregate_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            event_id: new_event_id(),
            event_type: event_type.into(),
            aggregate_type,
            aggregate_id: aggregate_id.into(),
            data,
            timestamp: Utc::now(),
            source: "control-plane".to_string(),
        }
    }

    /// Sets the emitting component.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Day partition key (`YYYY-MM-DD`) for this event.
    pub fn partition_key(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }

    // Device lifecycle -------------------------------------------------------

    /// A device came back online after the given offline window.
    #[must_use]
    pub fn device_online(device_uuid: &str, offline_seconds: i64) -> Self {
        Self::new(
            "device.online",
            AggregateType::Device,
            device_uuid,
            json!({ "offline_seconds": offline_seconds }),
        )
    }

    /// A device was marked offline by the sweep.
    #[must_use]
    pub fn device_offline(device_uuid: &str) -> Self {
        Self::new(
            "device.offline",
            AggregateType::Device,
            device_uuid,
            Value::Null,
        )
    }

    /// A device's target state was mutated.
    #[must_use]
    pub fn target_state_updated(device_uuid: &str, version: u64, old_apps: Value, new_apps: Value) -> Self {
        Self::new(
            "target_state.updated",
            AggregateType::Device,
            device_uuid,
            json!({ "version": version, "old_apps": old_apps, "new_apps": new_apps }),
        )
    }

    // Rollout lifecycle ------------------------------------------------------

    /// A rollout was planned and persisted.
    #[must_use]
    pub fn rollout_created(rollout_id: &str, image: &str, old_tag: &str, new_tag: &str, devices: usize) -> Self {
        Self::new(
            "image.rollout_created",
            AggregateType::Rollout,
            rollout_id,
            json!({ "image": image, "old_tag": old_tag, "new_tag": new_tag, "devices": devices }),
        )
    }

    /// A batch was activated.
    #[must_use]
    pub fn rollout_batch_started(rollout_id: &str, batch: u32, devices: usize) -> Self {
        Self::new(
            "rollout.batch_started",
            AggregateType::Rollout,
            rollout_id,
            json!({ "batch": batch, "devices": devices }),
        )
    }

    /// A rollout reached `completed`.
    #[must_use]
    pub fn rollout_completed(rollout_id: &str, healthy: usize) -> Self {
        Self::new(
            "rollout.completed",
            AggregateType::Rollout,
            rollout_id,
            json!({ "healthy": healthy }),
        )
    }

    /// The failure-rate guard paused a rollout.
    #[must_use]
    pub fn rollout_paused(rollout_id: &str, failure_rate: f64) -> Self {
        Self::new(
            "rollout.paused",
            AggregateType::Rollout,
            rollout_id,
            json!({ "failure_rate": failure_rate }),
        )
    }

    /// A rollout reached `failed`.
    #[must_use]
    pub fn rollout_failed(rollout_id: &str, reason: &str) -> Self {
        Self::new(
            "rollout.failed",
            AggregateType::Rollout,
            rollout_id,
            json!({ "reason": reason }),
        )
    }

    /// A device (or the whole rollout) was reverted to the previous tag.
    #[must_use]
    pub fn rollout_device_rolled_back(rollout_id: &str, device_uuid: &str, old_tag: &str) -> Self {
        Self::new(
            "rollout.device_rolled_back",
            AggregateType::Rollout,
            rollout_id,
            json!({ "device_uuid": device_uuid, "restored_tag": old_tag }),
        )
    }

    /// A health check concluded for a device row.
    #[must_use]
    pub fn health_check_result(rollout_id: &str, device_uuid: &str, passed: bool, detail: Option<&str>) -> Self {
        let event_type = if passed {
            "rollout.health_check_passed"
        } else {
            "rollout.health_check_failed"
        };
        Self::new(
            event_type,
            AggregateType::Rollout,
            rollout_id,
            json!({ "device_uuid": device_uuid, "detail": detail }),
        )
    }

    // Image registry ---------------------------------------------------------

    /// A registry push notification arrived.
    #[must_use]
    pub fn image_webhook_received(image: &str, tag: &str, provider: &str) -> Self {
        Self::new(
            "image.webhook_received",
            AggregateType::Image,
            image,
            json!({ "tag": tag, "provider": provider }),
        )
    }

    /// An approval request was opened for an unknown image.
    #[must_use]
    pub fn image_approval_requested(image: &str, tag: &str) -> Self {
        Self::new(
            "image.approval_requested",
            AggregateType::Image,
            image,
            json!({ "tag": tag }),
        )
    }
}

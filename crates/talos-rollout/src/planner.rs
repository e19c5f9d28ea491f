//! Rollout planning: affected-device enumeration and batch assignment.

use talos_core::{
    Device, DeviceRollout, DeviceUuid, RolloutStrategy, TargetStateDocument, UpdatePolicy,
};
use tracing::debug;

/// A computed rollout plan: the affected devices, their batch assignment,
/// and the tag the fleet is migrating away from.
#[derive(Debug, Clone)]
pub struct RolloutPlan {
    /// Tag seen on the first matched service (the rollback target).
    pub old_tag: String,

    /// One pending row per affected device, batch assigned.
    pub rows: Vec<DeviceRollout>,

    /// Number of batches after trailing-batch elision.
    pub total_batches: u32,
}

impl RolloutPlan {
    /// Number of affected devices.
    pub fn device_count(&self) -> usize {
        self.rows.len()
    }

    /// Devices assigned to the given 1-indexed batch.
    pub fn batch(&self, batch_number: u32) -> Vec<&DeviceRollout> {
        self.rows
            .iter()
            .filter(|r| r.batch_number == batch_number)
            .collect()
    }
}

/// Computes a rollout plan, or `None` when no device is affected.
///
/// A device is affected iff some service in its target state references
/// `image_name` (in either image field) with a tag other than `new_tag`,
/// and the device passes the policy's filters. Devices are uuid-sorted
/// before batching, so the same fleet and tag always produce the same plan.
pub fn plan_rollout(
    documents: &[(DeviceUuid, TargetStateDocument)],
    devices: &[Device],
    policy: &UpdatePolicy,
    image_name: &str,
    new_tag: &str,
) -> Option<RolloutPlan> {
    let mut affected: Vec<DeviceUuid> = Vec::new();
    let mut old_tag: Option<String> = None;

    // `documents` comes uuid-sorted from the target-state service; keep the
    // order rather than re-sorting.
    for (uuid, doc) in documents {
        let device = devices.iter().find(|d| d.uuid == *uuid);
        let Some(device) = device else { continue };
        if !device.is_active || !policy.filter.matches(device) {
            continue;
        }

        let mut device_old_tag = None;
        for (_, service) in doc.state.services_for_image(image_name) {
            if let Some(image) = service.image() {
                if image.tag != new_tag {
                    device_old_tag = Some(image.tag);
                    break;
                }
            }
        }

        if let Some(tag) = device_old_tag {
            if old_tag.is_none() {
                old_tag = Some(tag);
            }
            affected.push(uuid.clone());
        }
    }

    let old_tag = old_tag?;
    if affected.is_empty() {
        return None;
    }

    let (rows, total_batches) = assign_batches(&affected, policy);
    debug!(
        image = %image_name,
        new_tag = %new_tag,
        devices = rows.len(),
        batches = total_batches,
        "computed rollout plan"
    );

    Some(RolloutPlan {
        old_tag,
        rows,
        total_batches,
    })
}

/// Partitions uuid-sorted devices into batches per the policy strategy.
fn assign_batches(affected: &[DeviceUuid], policy: &UpdatePolicy) -> (Vec<DeviceRollout>, u32) {
    let total = affected.len();

    if policy.strategy == RolloutStrategy::Auto {
        let rows = affected
            .iter()
            .map(|uuid| DeviceRollout::new(uuid.clone(), 1))
            .collect();
        return (rows, 1);
    }

    // Cumulative percentages become cumulative device counts; the last
    // batch absorbs the remainder and empty trailing batches are elided.
    let mut bounds: Vec<usize> = policy
        .staged_batches
        .iter()
        .map(|pct| cumulative_count(total, *pct))
        .collect();
    if let Some(last) = bounds.last_mut() {
        *last = total;
    }

    let mut rows = Vec::with_capacity(total);
    let mut batch_number: u32 = 0;
    let mut start = 0;
    for bound in bounds {
        let bound = bound.min(total);
        if bound <= start {
            continue;
        }
        batch_number += 1;
        for uuid in &affected[start..bound] {
            rows.push(DeviceRollout::new(uuid.clone(), batch_number));
        }
        start = bound;
    }

    (rows, batch_number)
}

/// `ceil(total * pct / 100)`, computed in integers.
fn cumulative_count(total: usize, pct: u8) -> usize {
    (total * usize::from(pct)).div_ceil(100)
}

//! Device registry store.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use talos_core::{Device, DeviceUuid};
use tokio::sync::RwLock;

use crate::error::{Result, StoreError};

/// Fleet-level counts for the admin surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct FleetSummary {
    /// Provisioned devices.
    pub total: usize,

    /// Devices currently online.
    pub online: usize,

    /// Devices with the admin flag set.
    pub active: usize,
}

/// Store of provisioned devices.
#[derive(Debug, Default)]
pub struct DeviceStore {
    devices: RwLock<HashMap<DeviceUuid, Device>>,
}

impl DeviceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a device.
    pub async fn upsert(&self, device: Device) {
        let mut devices = self.devices.write().await;
        devices.insert(device.uuid.clone(), device);
    }

    /// Fetches a device by uuid.
    pub async fn get(&self, uuid: &str) -> Result<Device> {
        let devices = self.devices.read().await;
        devices
            .get(uuid)
            .cloned()
            .ok_or_else(|| StoreError::DeviceNotFound {
                uuid: uuid.to_string(),
            })
    }

    /// Lists all devices, uuid-sorted.
    pub async fn list(&self) -> Vec<Device> {
        let devices = self.devices.read().await;
        let mut all: Vec<Device> = devices.values().cloned().collect();
        all.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        all
    }

    /// Sets the admin active flag.
    pub async fn set_active(&self, uuid: &str, active: bool) -> Result<()> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(uuid)
            .ok_or_else(|| StoreError::DeviceNotFound {
                uuid: uuid.to_string(),
            })?;
        device.is_active = active;
        Ok(())
    }

    /// Records a poll from the device.
    ///
    /// Returns the offline duration when this poll transitioned the device
    /// back online, `None` when it was already online.
    pub async fn mark_seen(&self, uuid: &str) -> Result<Option<Duration>> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(uuid)
            .ok_or_else(|| StoreError::DeviceNotFound {
                uuid: uuid.to_string(),
            })?;
        Ok(device.mark_seen(Utc::now()))
    }

    /// Marks devices offline whose last poll is older than `threshold`.
    ///
    /// Returns the uuids that transitioned from online to offline.
    pub async fn sweep_offline(&self, threshold: Duration) -> Vec<DeviceUuid> {
        let cutoff = Utc::now() - threshold;
        let mut transitioned = Vec::new();
        let mut devices = self.devices.write().await;
        for device in devices.values_mut() {
            if device.is_online && device.last_seen.is_none_or(|seen| seen < cutoff) {
                device.is_online = false;
                transitioned.push(device.uuid.clone());
            }
        }
        transitioned.sort();
        transitioned
    }

    /// Returns fleet-level counts.
    pub async fn summary(&self) -> FleetSummary {
        let devices = self.devices.read().await;
        FleetSummary {
            total: devices.len(),
            online: devices.values().filter(|d| d.is_online).count(),
            active: devices.values().filter(|d| d.is_active).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = DeviceStore::new();
        store.upsert(Device::new("dev-1", "sensor")).await;

        let device = store.get("dev-1").await.unwrap();
        assert_eq!(device.name, "sensor");
    }

    #[tokio::test]
    async fn test_get_missing_device() {
        let store = DeviceStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::DeviceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_is_uuid_sorted() {
        let store = DeviceStore::new();
        store.upsert(Device::new("dev-b", "b")).await;
        store.upsert(Device::new("dev-a", "a")).await;

        let all = store.list().await;
        assert_eq!(all[0].uuid, "dev-a");
        assert_eq!(all[1].uuid, "dev-b");
    }

    #[tokio::test]
    async fn test_set_active() {
        let store = DeviceStore::new();
        store.upsert(Device::new("dev-1", "sensor")).await;

        store.set_active("dev-1", false).await.unwrap();
        assert!(!store.get("dev-1").await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_mark_seen_reports_transition_once() {
        let store = DeviceStore::new();
        store.upsert(Device::new("dev-1", "sensor")).await;

        assert!(store.mark_seen("dev-1").await.unwrap().is_some());
        assert!(store.mark_seen("dev-1").await.unwrap().is_none());
        assert!(store.get("dev-1").await.unwrap().is_online);
    }

    #[tokio::test]
    async fn test_sweep_offline() {
        let store = DeviceStore::new();
        let mut stale = Device::new("dev-stale", "sensor");
        stale.is_online = true;
        stale.last_seen = Some(Utc::now() - Duration::minutes(30));
        store.upsert(stale).await;

        let mut fresh = Device::new("dev-fresh", "sensor");
        fresh.is_online = true;
        fresh.last_seen = Some(Utc::now());
        store.upsert(fresh).await;

        let transitioned = store.sweep_offline(Duration::minutes(10)).await;
        assert_eq!(transitioned, vec!["dev-stale".to_string()]);
        assert!(!store.get("dev-stale").await.unwrap().is_online);
        assert!(store.get("dev-fresh").await.unwrap().is_online);

        // The sweep is idempotent.
        assert!(store.sweep_offline(Duration::minutes(10)).await.is_empty());
    }

    #[tokio::test]
    async fn test_summary() {
        let store = DeviceStore::new();
        let mut online = Device::new("dev-1", "a");
        online.is_online = true;
        store.upsert(online).await;
        let mut inactive = Device::new("dev-2", "b");
        inactive.is_active = false;
        store.upsert(inactive).await;

        let summary = store.summary().await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.online, 1);
        assert_eq!(summary.active, 1);
    }
}

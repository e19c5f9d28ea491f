//! Device identity and catalog types.
//!
//! Devices are provisioned with an opaque uuid and a bearer API key (the
//! control plane stores only the hash). `is_active` is the admin kill
//! switch; `is_online` is derived from poll activity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::Service;

/// Unique identifier for a provisioned device.
pub type DeviceUuid = String;

/// A provisioned edge device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Opaque identifier assigned on provisioning.
    pub uuid: DeviceUuid,

    /// Friendly name.
    pub name: String,

    /// Device type (hardware class / profile).
    pub device_type: String,

    /// Admin flag; inactive devices fail authentication.
    pub is_active: bool,

    /// Derived flag; true while the device is polling.
    pub is_online: bool,

    /// Last time the device was seen polling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,

    /// bcrypt hash of the device API key. Never serialized outward.
    #[serde(skip)]
    pub api_key_hash: Option<String>,

    /// Fleet this device belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fleet_id: Option<String>,

    /// Free-form labels used by rollout policy filters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Device {
    /// Creates a new active device.
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            device_type: "generic".to_string(),
            is_active: true,
            is_online: false,
            last_seen: None,
            api_key_hash: None,
            fleet_id: None,
            tags: Vec::new(),
        }
    }

    /// Sets the device type.
    pub fn with_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = device_type.into();
        self
    }

    /// Sets the fleet id.
    pub fn with_fleet(mut self, fleet_id: impl Into<String>) -> Self {
        self.fleet_id = Some(fleet_id.into());
        self
    }

    /// Adds a label.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Sets the stored API key hash.
    pub fn with_api_key_hash(mut self, hash: impl Into<String>) -> Self {
        self.api_key_hash = Some(hash.into());
        self
    }

    /// Marks the device as seen now, returning the previous offline
    /// duration when this poll brought it back online.
    pub fn mark_seen(&mut self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let was_offline = !self.is_online;
        let offline_for = if was_offline {
            self.last_seen.map(|t| now - t)
        } else {
            None
        };
        self.is_online = true;
        self.last_seen = Some(now);
        offline_for.or(if was_offline {
            Some(chrono::Duration::zero())
        } else {
            None
        })
    }
}

/// A catalog entry: a shared app definition devices can be provisioned from.
///
/// Per-device target-state documents may override any field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTemplate {
    /// Global application id. User apps start at 1000.
    pub app_id: u32,

    /// Template name.
    pub name: String,

    /// Unique URL-safe identifier.
    pub slug: String,

    /// Default services a device gets when provisioned from this template.
    #[serde(default)]
    pub default_services: Vec<Service>,
}

impl AppTemplate {
    /// First app id available to user-defined apps.
    pub const USER_APP_ID_FLOOR: u32 = 1000;

    /// Creates a new template.
    pub fn new(app_id: u32, name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            app_id,
            name: name.into(),
            slug: slug.into(),
            default_services: Vec::new(),
        }
    }

    /// Appends a default service.
    pub fn with_service(mut self, service: Service) -> Self {
        self.default_services.push(service);
        self
    }

    /// Returns true if this is a user-defined (non-system) app.
    pub fn is_user_app(&self) -> bool {
        self.app_id >= Self::USER_APP_ID_FLOOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_defaults() {
        let device = Device::new("dev-1", "lobby-sensor");
        assert!(device.is_active);
        assert!(!device.is_online);
        assert!(device.last_seen.is_none());
        assert_eq!(device.device_type, "generic");
    }

    #[test]
    fn test_device_builders() {
        let device = Device::new("dev-1", "lobby-sensor")
            .with_type("gateway")
            .with_fleet("fleet-eu")
            .with_tag("canary");

        assert_eq!(device.device_type, "gateway");
        assert_eq!(device.fleet_id.as_deref(), Some("fleet-eu"));
        assert_eq!(device.tags, vec!["canary".to_string()]);
    }

    #[test]
    fn test_mark_seen_transitions_online() {
        let mut device = Device::new("dev-1", "sensor");
        let now = Utc::now();

        // First poll ever: came online, no measurable offline window.
        let offline_for = device.mark_seen(now);
        assert!(device.is_online);
        assert_eq!(offline_for, Some(chrono::Duration::zero()));

        // Already online: no transition reported.
        assert!(device.mark_seen(now).is_none());
    }

    #[test]
    fn test_mark_seen_reports_offline_duration() {
        let mut device = Device::new("dev-1", "sensor");
        let earlier = Utc::now() - chrono::Duration::minutes(10);
        device.last_seen = Some(earlier);
        device.is_online = false;

        let offline_for = device.mark_seen(Utc::now()).unwrap();
        assert!(offline_for >= chrono::Duration::minutes(10));
    }

    #[test]
    fn test_api_key_hash_not_serialized() {
        let device = Device::new("dev-1", "sensor").with_api_key_hash("$2b$10$abc");
        let json = serde_json::to_string(&device).unwrap();
        assert!(!json.contains("$2b$10$abc"));
    }

    #[test]
    fn test_app_template() {
        let template = AppTemplate::new(1002, "Cache", "cache")
            .with_service(Service::new(1, "redis").with_image("redis:7-alpine"));
        assert!(template.is_user_app());
        assert_eq!(template.default_services.len(), 1);

        let system = AppTemplate::new(3, "Supervisor", "supervisor");
        assert!(!system.is_user_app());
    }
}

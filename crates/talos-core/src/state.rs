//! Target and current state documents.
//!
//! The target state is the declarative description of what a device should
//! be running; the current state is the device's self-report of what it is
//! running. Both share the `apps` tree shape: app-id → app → ordered
//! services. App ids are serialized as JSON object keys (strings on the
//! wire, integers in memory).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::image::{ImageRef, ImageSlot};

/// Key under `Service::config` that may carry the image reference.
const CONFIG_IMAGE_KEY: &str = "image";

/// A containerized service inside an app.
///
/// The image reference may live in the service-level `imageName` field, in
/// `config.image`, or in both. Readers accept either; writers rewrite every
/// populated field and never move the reference between fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Service identifier, unique within its app.
    #[serde(rename = "serviceId")]
    pub id: u32,

    /// Service name (also the container name on the device).
    #[serde(rename = "serviceName")]
    pub name: String,

    /// Service-level image reference.
    #[serde(rename = "imageName", skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,

    /// Service configuration. May carry an `image` entry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, Value>,
}

impl Service {
    /// Creates a new service with no image reference.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            image_name: None,
            config: BTreeMap::new(),
        }
    }

    /// Sets the service-level `imageName` field.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image_name = Some(image.into());
        self
    }

    /// Sets the nested `config.image` entry.
    pub fn with_config_image(mut self, image: impl Into<String>) -> Self {
        self.config
            .insert(CONFIG_IMAGE_KEY.to_string(), Value::String(image.into()));
        self
    }

    /// Adds a configuration entry.
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Returns the image reference from whichever field is populated.
    ///
    /// The service-level field wins when both are present; on write the two
    /// are kept in sync, so a disagreement only arises from hand-edited
    /// documents.
    pub fn image(&self) -> Option<ImageRef> {
        if let Some(name) = &self.image_name {
            return ImageRef::parse(name).ok();
        }
        self.config_image_str()
            .and_then(|s| ImageRef::parse(s).ok())
    }

    /// Returns which field(s) carry the image reference.
    pub fn image_slot(&self) -> Option<ImageSlot> {
        match (self.image_name.is_some(), self.config_image_str().is_some()) {
            (true, true) => Some(ImageSlot::Both),
            (true, false) => Some(ImageSlot::ServiceField),
            (false, true) => Some(ImageSlot::ConfigField),
            (false, false) => None,
        }
    }

    /// Rewrites every populated image field to the given reference.
    ///
    /// Returns false (and writes nothing) if neither field is populated.
    pub fn set_image(&mut self, image: &ImageRef) -> bool {
        let rendered = image.to_string();
        let mut written = false;

        if self.image_name.is_some() {
            self.image_name = Some(rendered.clone());
            written = true;
        }
        if let Some(slot) = self.config.get_mut(CONFIG_IMAGE_KEY) {
            if slot.is_string() {
                *slot = Value::String(rendered);
                written = true;
            }
        }

        written
    }

    fn config_image_str(&self) -> Option<&str> {
        self.config.get(CONFIG_IMAGE_KEY).and_then(Value::as_str)
    }
}

/// An application: a named, ordered group of services on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    /// Application identifier (user apps start at 1000).
    #[serde(rename = "appId")]
    pub id: u32,

    /// Application name.
    #[serde(rename = "appName")]
    pub name: String,

    /// Services belonging to this app, in start order.
    #[serde(default)]
    pub services: Vec<Service>,
}

impl App {
    /// Creates a new app with no services.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            services: Vec::new(),
        }
    }

    /// Appends a service.
    pub fn with_service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    /// Finds a service by id.
    pub fn service(&self, service_id: u32) -> Option<&Service> {
        self.services.iter().find(|s| s.id == service_id)
    }
}

/// The declarative body of a device's target state: apps plus device config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetState {
    /// Apps keyed by app id.
    #[serde(default)]
    pub apps: BTreeMap<u32, App>,

    /// Device-level settings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, Value>,
}

impl TargetState {
    /// Creates an empty target state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an app, keyed by its id.
    pub fn with_app(mut self, app: App) -> Self {
        self.apps.insert(app.id, app);
        self
    }

    /// Adds a device-level config entry.
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Validates structural invariants of the document.
    ///
    /// App ids must be ≥ 1 and match their map key; service ids must be
    /// unique within an app.
    pub fn validate(&self) -> Result<()> {
        for (key, app) in &self.apps {
            if app.id == 0 {
                return Err(Error::InvalidDocument {
                    reason: format!("app '{}' has id 0 (ids start at 1)", app.name),
                });
            }
            if *key != app.id {
                return Err(Error::InvalidDocument {
                    reason: format!("app key {key} does not match app id {}", app.id),
                });
            }
            let mut seen = std::collections::BTreeSet::new();
            for service in &app.services {
                if !seen.insert(service.id) {
                    return Err(Error::InvalidDocument {
                        reason: format!(
                            "duplicate service id {} in app {}",
                            service.id, app.id
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Iterates over `(app_id, service)` pairs whose image names the given
    /// image, regardless of which field carries the reference.
    pub fn services_for_image<'a>(
        &'a self,
        image_name: &'a str,
    ) -> impl Iterator<Item = (u32, &'a Service)> + 'a {
        self.apps.values().flat_map(move |app| {
            app.services
                .iter()
                .filter(move |s| s.image().is_some_and(|i| i.names_image(image_name)))
                .map(move |s| (app.id, s))
        })
    }

    /// Rewrites the image of the service at `(app_id, service_id)`.
    ///
    /// Both the service-level field and `config.image` are rewritten when
    /// present. Fails with [`Error::ServicePathNotFound`] when the path does
    /// not exist and [`Error::ServiceNotUpdatable`] when the service carries
    /// no image field.
    pub fn set_image_for_service(
        &mut self,
        app_id: u32,
        service_id: u32,
        image: &ImageRef,
    ) -> Result<()> {
        let service = self
            .apps
            .get_mut(&app_id)
            .and_then(|app| app.services.iter_mut().find(|s| s.id == service_id))
            .ok_or(Error::ServicePathNotFound { app_id, service_id })?;

        if service.set_image(image) {
            Ok(())
        } else {
            Err(Error::ServiceNotUpdatable { app_id, service_id })
        }
    }
}

/// A versioned, stored target-state document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetStateDocument {
    /// The declarative state body (the part devices receive).
    pub state: TargetState,

    /// Monotonically non-decreasing version; incremented on every accepted
    /// mutation.
    pub version: u64,

    /// When the document was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl TargetStateDocument {
    /// Creates a version-1 document from a state body.
    pub fn new(state: TargetState) -> Self {
        Self {
            state,
            version: 1,
            updated_at: Utc::now(),
        }
    }
}

/// Runtime status of a container as reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is running.
    Running,
    /// Container exists but is stopped.
    Stopped,
    /// Container is restarting.
    Restarting,
    /// Container exited.
    Exited,
    /// Status could not be determined.
    #[default]
    Unknown,
}

impl ContainerStatus {
    /// Returns a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Restarting => "restarting",
            Self::Exited => "exited",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reported runtime state of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReport {
    /// Service identifier.
    #[serde(rename = "serviceId")]
    pub id: u32,

    /// Service (container) name.
    #[serde(rename = "serviceName")]
    pub name: String,

    /// Reported container status.
    #[serde(default)]
    pub status: ContainerStatus,

    /// Image the container is actually running, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Reported runtime state of one app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppReport {
    /// Per-service runtime reports.
    #[serde(default)]
    pub services: Vec<ServiceReport>,
}

/// Host-level telemetry reported alongside app state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Device IP address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Uptime in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,

    /// Additional resource-usage fields (CPU, memory, disk).
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A device's current-state report as received by the control plane.
///
/// `apps` is optional: a report without it only refreshes `system_info` and
/// must never shrink the stored app set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentStateReport {
    /// Reported app state, keyed by app id. Optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apps: Option<BTreeMap<u32, AppReport>>,

    /// Reported host telemetry. Optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_info: Option<SystemInfo>,
}

impl CurrentStateReport {
    /// Returns true if the report carries a non-empty app section.
    pub fn has_apps(&self) -> bool {
        self.apps.as_ref().is_some_and(|apps| !apps.is_empty())
    }

    /// Returns true if any reported service runs the given image at the
    /// given tag.
    pub fn reports_image(&self, image_name: &str, tag: &str) -> bool {
        let Some(apps) = &self.apps else {
            return false;
        };
        apps.values()
            .flat_map(|a| &a.services)
            .filter_map(|s| s.image.as_deref())
            .filter_map(|i| ImageRef::parse(i).ok())
            .any(|i| i.names_image(image_name) && i.tag == tag)
    }
}

/// The stored current state for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentStateDocument {
    /// Last reported app state.
    #[serde(default)]
    pub apps: BTreeMap<u32, AppReport>,

    /// Last reported host telemetry.
    #[serde(default)]
    pub system_info: SystemInfo,

    /// When the last report arrived.
    pub reported_at: DateTime<Utc>,
}

impl Default for CurrentStateDocument {
    fn default() -> Self {
        Self {
            apps: BTreeMap::new(),
            system_info: SystemInfo::default(),
            reported_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl CurrentStateDocument {
    /// Applies a report, honoring the partial-update invariant: an absent
    /// or empty `apps` section preserves the stored apps.
    ///
    /// Applying the same report twice yields the same document (modulo
    /// `reported_at`).
    pub fn apply(&mut self, report: &CurrentStateReport) {
        if report.has_apps() {
            if let Some(apps) = &report.apps {
                self.apps = apps.clone();
            }
        }
        if let Some(info) = &report.system_info {
            self.system_info = info.clone();
        }
        self.reported_at = Utc::now();
    }

    /// Finds a service report by container name across all apps.
    pub fn service_report(&self, container: &str) -> Option<&ServiceReport> {
        self.apps
            .values()
            .flat_map(|a| &a.services)
            .find(|s| s.name == container)
    }

    /// Returns true if the named container is reported `running` with the
    /// given image tag.
    pub fn container_running_with_tag(&self, container: &str, image_name: &str, tag: &str) -> bool {
        self.service_report(container).is_some_and(|s| {
            s.status == ContainerStatus::Running
                && s.image
                    .as_deref()
                    .and_then(|i| ImageRef::parse(i).ok())
                    .is_some_and(|i| i.names_image(image_name) && i.tag == tag)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_service() -> Service {
        Service::new(1, "redis").with_image("redis:7-alpine")
    }

    #[test]
    fn test_service_image_from_service_field() {
        let service = redis_service();
        let image = service.image().unwrap();
        assert_eq!(image.repository, "redis");
        assert_eq!(image.tag, "7-alpine");
        assert_eq!(service.image_slot(), Some(ImageSlot::ServiceField));
    }

    #[test]
    fn test_service_image_from_config_field() {
        let service = Service::new(2, "sensor-hub").with_config_image("acme/hub:2.0");
        let image = service.image().unwrap();
        assert_eq!(image.repository, "acme/hub");
        assert_eq!(service.image_slot(), Some(ImageSlot::ConfigField));
    }

    #[test]
    fn test_service_without_image() {
        let service = Service::new(3, "sidecar");
        assert!(service.image().is_none());
        assert!(service.image_slot().is_none());
    }

    #[test]
    fn test_set_image_rewrites_both_fields() {
        let mut service = Service::new(1, "redis")
            .with_image("redis:7-alpine")
            .with_config_image("redis:7-alpine");
        assert_eq!(service.image_slot(), Some(ImageSlot::Both));

        let updated = service.set_image(&ImageRef::new("redis", "7.2-alpine"));
        assert!(updated);
        assert_eq!(service.image_name.as_deref(), Some("redis:7.2-alpine"));
        assert_eq!(
            service.config.get("image").and_then(Value::as_str),
            Some("redis:7.2-alpine")
        );
    }

    #[test]
    fn test_set_image_preserves_source_field() {
        // A config-only reference must stay in config; imageName stays empty.
        let mut service = Service::new(2, "hub").with_config_image("acme/hub:2.0");
        assert!(service.set_image(&ImageRef::new("acme/hub", "2.1")));
        assert!(service.image_name.is_none());
        assert_eq!(
            service.config.get("image").and_then(Value::as_str),
            Some("acme/hub:2.1")
        );
    }

    #[test]
    fn test_set_image_fails_without_fields() {
        let mut service = Service::new(3, "sidecar");
        assert!(!service.set_image(&ImageRef::new("x", "1")));
    }

    #[test]
    fn test_target_state_set_image_for_service() {
        let mut state = TargetState::new()
            .with_app(App::new(1002, "cache").with_service(redis_service()));

        state
            .set_image_for_service(1002, 1, &ImageRef::new("redis", "7.2-alpine"))
            .unwrap();

        let image = state.apps[&1002].service(1).unwrap().image().unwrap();
        assert_eq!(image.tag, "7.2-alpine");
    }

    #[test]
    fn test_set_image_for_service_path_not_found() {
        let mut state = TargetState::new();
        let err = state
            .set_image_for_service(1002, 1, &ImageRef::new("redis", "7"))
            .unwrap_err();
        assert!(matches!(err, Error::ServicePathNotFound { .. }));
    }

    #[test]
    fn test_set_image_for_service_not_updatable() {
        let mut state = TargetState::new()
            .with_app(App::new(1002, "cache").with_service(Service::new(1, "bare")));
        let err = state
            .set_image_for_service(1002, 1, &ImageRef::new("redis", "7"))
            .unwrap_err();
        assert!(matches!(err, Error::ServiceNotUpdatable { .. }));
    }

    #[test]
    fn test_services_for_image_matches_either_field() {
        let state = TargetState::new()
            .with_app(App::new(1002, "cache").with_service(redis_service()))
            .with_app(
                App::new(1003, "cache-b")
                    .with_service(Service::new(1, "redis-b").with_config_image("redis:6")),
            )
            .with_app(
                App::new(1004, "web").with_service(Service::new(1, "nginx").with_image("nginx:1")),
            );

        let matched: Vec<u32> = state.services_for_image("redis").map(|(a, _)| a).collect();
        assert_eq!(matched, vec![1002, 1003]);
    }

    #[test]
    fn test_validate_rejects_mismatched_key() {
        let mut state = TargetState::new();
        state.apps.insert(7, App::new(1002, "cache"));
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_service_ids() {
        let state = TargetState::new().with_app(
            App::new(1002, "cache")
                .with_service(Service::new(1, "a"))
                .with_service(Service::new(1, "b")),
        );
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_app_key_serializes_as_string() {
        let state = TargetState::new().with_app(App::new(1002, "cache"));
        let json = serde_json::to_value(&state).unwrap();
        assert!(json["apps"]["1002"].is_object());
    }

    #[test]
    fn test_current_state_apply_preserves_apps_when_absent() {
        let mut doc = CurrentStateDocument::default();
        let mut apps = BTreeMap::new();
        apps.insert(
            1002,
            AppReport {
                services: vec![ServiceReport {
                    id: 1,
                    name: "redis".to_string(),
                    status: ContainerStatus::Running,
                    image: Some("redis:7-alpine".to_string()),
                }],
            },
        );
        doc.apply(&CurrentStateReport {
            apps: Some(apps),
            system_info: None,
        });
        assert_eq!(doc.apps.len(), 1);

        // A system-info-only report must not shrink the app set.
        doc.apply(&CurrentStateReport {
            apps: None,
            system_info: Some(SystemInfo {
                ip: Some("192.168.1.10".to_string()),
                ..SystemInfo::default()
            }),
        });
        assert_eq!(doc.apps.len(), 1);
        assert_eq!(doc.system_info.ip.as_deref(), Some("192.168.1.10"));

        // An empty apps map behaves like an absent one.
        doc.apply(&CurrentStateReport {
            apps: Some(BTreeMap::new()),
            system_info: None,
        });
        assert_eq!(doc.apps.len(), 1);
    }

    #[test]
    fn test_current_state_apply_is_idempotent() {
        let mut apps = BTreeMap::new();
        apps.insert(1002, AppReport::default());
        let report = CurrentStateReport {
            apps: Some(apps),
            system_info: Some(SystemInfo::default()),
        };

        let mut doc = CurrentStateDocument::default();
        doc.apply(&report);
        let first = (doc.apps.clone(), doc.system_info.clone());
        doc.apply(&report);
        assert_eq!((doc.apps.clone(), doc.system_info.clone()), first);
    }

    #[test]
    fn test_report_reports_image() {
        let mut apps = BTreeMap::new();
        apps.insert(
            1002,
            AppReport {
                services: vec![ServiceReport {
                    id: 1,
                    name: "redis".to_string(),
                    status: ContainerStatus::Running,
                    image: Some("redis:7.2-alpine".to_string()),
                }],
            },
        );
        let report = CurrentStateReport {
            apps: Some(apps),
            system_info: None,
        };

        assert!(report.reports_image("redis", "7.2-alpine"));
        assert!(!report.reports_image("redis", "7-alpine"));
        assert!(!report.reports_image("nginx", "7.2-alpine"));
    }

    #[test]
    fn test_container_running_with_tag() {
        let mut doc = CurrentStateDocument::default();
        doc.apps.insert(
            1002,
            AppReport {
                services: vec![ServiceReport {
                    id: 1,
                    name: "redis".to_string(),
                    status: ContainerStatus::Exited,
                    image: Some("redis:7.2-alpine".to_string()),
                }],
            },
        );
        // Present but not running.
        assert!(!doc.container_running_with_tag("redis", "redis", "7.2-alpine"));

        doc.apps.get_mut(&1002).unwrap().services[0].status = ContainerStatus::Running;
        assert!(doc.container_running_with_tag("redis", "redis", "7.2-alpine"));
        assert!(!doc.container_running_with_tag("missing", "redis", "7.2-alpine"));
    }

    #[test]
    fn test_container_status_display() {
        assert_eq!(ContainerStatus::Running.to_string(), "running");
        assert_eq!(ContainerStatus::Exited.as_str(), "exited");
    }

    #[test]
    fn test_report_deserializes_wire_shape() {
        let json = r#"{
            "apps": {
                "1002": {
                    "services": [
                        {"serviceId": 1, "serviceName": "redis", "status": "running", "image": "redis:7-alpine"}
                    ]
                }
            },
            "system_info": {"ip": "10.0.0.5", "uptime_seconds": 4200, "cpu_percent": 12.5}
        }"#;
        let report: CurrentStateReport = serde_json::from_str(json).unwrap();
        assert!(report.has_apps());
        let info = report.system_info.unwrap();
        assert_eq!(info.ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(info.uptime_seconds, Some(4200));
        assert!(info.extra.contains_key("cpu_percent"));
    }
}

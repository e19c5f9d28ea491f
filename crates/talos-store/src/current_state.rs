//! Current-state store.
//!
//! Devices own their current state; the control plane only records what
//! they report. Reports are partial-update safe: a report without an
//! `apps` section never shrinks the stored app set.

use std::collections::HashMap;

use talos_core::{CurrentStateDocument, CurrentStateReport, DeviceUuid};
use tokio::sync::RwLock;

/// Store of per-device current-state documents.
#[derive(Debug, Default)]
pub struct CurrentStateStore {
    documents: RwLock<HashMap<DeviceUuid, CurrentStateDocument>>,
}

impl CurrentStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a device report and returns the resulting document.
    ///
    /// Creates the document on first report. Replaying the same report is
    /// idempotent.
    pub async fn apply_report(
        &self,
        uuid: &str,
        report: &CurrentStateReport,
    ) -> CurrentStateDocument {
        let mut documents = self.documents.write().await;
        let doc = documents.entry(uuid.to_string()).or_default();
        doc.apply(report);
        doc.clone()
    }

    /// Returns the stored document, if the device has ever reported.
    pub async fn get(&self, uuid: &str) -> Option<CurrentStateDocument> {
        let documents = self.documents.read().await;
        documents.get(uuid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use talos_core::{AppReport, ContainerStatus, ServiceReport, SystemInfo};

    fn report_with_apps(tag: &str) -> CurrentStateReport {
        let mut apps = BTreeMap::new();
        apps.insert(
            1002,
            AppReport {
                services: vec![ServiceReport {
                    id: 1,
                    name: "redis".to_string(),
                    status: ContainerStatus::Running,
                    image: Some(format!("redis:{tag}")),
                }],
            },
        );
        CurrentStateReport {
            apps: Some(apps),
            system_info: None,
        }
    }

    #[tokio::test]
    async fn test_first_report_creates_document() {
        let store = CurrentStateStore::new();
        assert!(store.get("dev-1").await.is_none());

        let doc = store.apply_report("dev-1", &report_with_apps("7")).await;
        assert_eq!(doc.apps.len(), 1);
        assert!(store.get("dev-1").await.is_some());
    }

    #[tokio::test]
    async fn test_system_info_only_report_preserves_apps() {
        let store = CurrentStateStore::new();
        store.apply_report("dev-1", &report_with_apps("7")).await;

        let doc = store
            .apply_report(
                "dev-1",
                &CurrentStateReport {
                    apps: None,
                    system_info: Some(SystemInfo {
                        ip: Some("192.168.1.10".to_string()),
                        ..SystemInfo::default()
                    }),
                },
            )
            .await;

        assert_eq!(doc.apps.len(), 1);
        assert_eq!(doc.system_info.ip.as_deref(), Some("192.168.1.10"));
    }

    #[tokio::test]
    async fn test_replayed_report_is_idempotent() {
        let store = CurrentStateStore::new();
        let report = report_with_apps("7.2");

        let first = store.apply_report("dev-1", &report).await;
        let second = store.apply_report("dev-1", &report).await;
        assert_eq!(first.apps, second.apps);
        assert_eq!(first.system_info, second.system_info);
    }

    #[tokio::test]
    async fn test_new_apps_replace_old_apps() {
        let store = CurrentStateStore::new();
        store.apply_report("dev-1", &report_with_apps("7")).await;
        let doc = store.apply_report("dev-1", &report_with_apps("7.2")).await;

        let image = doc.apps[&1002].services[0].image.as_deref();
        assert_eq!(image, Some("redis:7.2"));
    }
}

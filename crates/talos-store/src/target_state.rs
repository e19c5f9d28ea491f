//! Target-state service: sole writer and canonical reader of per-device
//! target-state documents.
//!
//! All mutations funnel through [`TargetStateService::update`], which
//! enforces the write contracts:
//!
//! - a write whose canonical hash equals the stored document is a no-op
//!   (no version bump, no event),
//! - an accepted write strictly increases `version`,
//! - concurrent writers are serialized by optimistic version CAS with
//!   bounded retry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use talos_audit::{DomainEvent, EventPublisher};
use talos_core::etag::etag_of;
use talos_core::{DeviceUuid, ImageRef, TargetState, TargetStateDocument};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, StoreError};

/// How many times a version-CAS miss is retried before surfacing `conflict`.
const CAS_RETRIES: u32 = 3;

/// Sole writer and canonical reader of target-state documents.
pub struct TargetStateService {
    documents: RwLock<HashMap<DeviceUuid, TargetStateDocument>>,
    publisher: Arc<EventPublisher>,
}

impl TargetStateService {
    /// Creates an empty service publishing to the given event publisher.
    pub fn new(publisher: Arc<EventPublisher>) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            publisher,
        }
    }

    /// Creates the version-1 document for a newly provisioned device.
    ///
    /// Replaces any existing document; use [`Self::update`] for ordinary
    /// mutations.
    pub async fn init_device(&self, uuid: impl Into<String>, state: TargetState) -> Result<()> {
        state.validate()?;
        let mut documents = self.documents.write().await;
        documents.insert(uuid.into(), TargetStateDocument::new(state));
        Ok(())
    }

    /// Removes a device's document (deprovisioning).
    pub async fn remove_device(&self, uuid: &str) -> Result<()> {
        let mut documents = self.documents.write().await;
        documents
            .remove(uuid)
            .map(|_| ())
            .ok_or_else(|| StoreError::TargetStateNotFound {
                uuid: uuid.to_string(),
            })
    }

    /// Returns the document and its ETag.
    pub async fn get(&self, uuid: &str) -> Result<(TargetStateDocument, String)> {
        let documents = self.documents.read().await;
        let doc = documents
            .get(uuid)
            .ok_or_else(|| StoreError::TargetStateNotFound {
                uuid: uuid.to_string(),
            })?;
        let etag = etag_of(&doc.state).map_err(StoreError::Core)?;
        Ok((doc.clone(), etag))
    }

    /// Returns every stored document, uuid-sorted (planner enumeration).
    pub async fn all(&self) -> Vec<(DeviceUuid, TargetStateDocument)> {
        let documents = self.documents.read().await;
        let mut all: Vec<(DeviceUuid, TargetStateDocument)> = documents
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Replaces the declarative body of a device's document.
    ///
    /// Returns the resulting version. Equal-hash writes are no-ops and
    /// return the current version unchanged. Version-CAS misses are retried
    /// up to [`CAS_RETRIES`] times before surfacing
    /// [`StoreError::VersionConflict`].
    pub async fn update(&self, uuid: &str, new_state: TargetState) -> Result<u64> {
        new_state.validate()?;
        let new_etag = etag_of(&new_state).map_err(StoreError::Core)?;

        let mut last_conflict = None;
        for _ in 0..CAS_RETRIES {
            let (expected_version, old_state) = {
                let documents = self.documents.read().await;
                let doc =
                    documents
                        .get(uuid)
                        .ok_or_else(|| StoreError::TargetStateNotFound {
                            uuid: uuid.to_string(),
                        })?;
                (doc.version, doc.state.clone())
            };

            let old_etag = etag_of(&old_state).map_err(StoreError::Core)?;
            if old_etag == new_etag {
                debug!(device_uuid = %uuid, version = expected_version, "target state unchanged, skipping write");
                return Ok(expected_version);
            }

            match self
                .try_commit(uuid, expected_version, new_state.clone())
                .await
            {
                Ok(version) => {
                    self.publisher.publish(DomainEvent::target_state_updated(
                        uuid,
                        version,
                        serde_json::to_value(&old_state.apps).unwrap_or_default(),
                        serde_json::to_value(&new_state.apps).unwrap_or_default(),
                    ));
                    return Ok(version);
                }
                Err(e @ StoreError::VersionConflict { .. }) => {
                    debug!(device_uuid = %uuid, "version conflict, retrying target-state write");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_conflict.unwrap_or(StoreError::VersionConflict {
            uuid: uuid.to_string(),
            expected: 0,
            actual: 0,
        }))
    }

    /// Rewrites the image of one service, preserving its source field(s).
    ///
    /// Returns the resulting document version.
    pub async fn set_image_for_service(
        &self,
        uuid: &str,
        app_id: u32,
        service_id: u32,
        new_tag: &str,
    ) -> Result<u64> {
        let (doc, _) = self.get(uuid).await?;
        let mut state = doc.state;

        let service = state
            .apps
            .get(&app_id)
            .and_then(|app| app.service(service_id))
            .ok_or(talos_core::Error::ServicePathNotFound { app_id, service_id })?;
        let current = service
            .image()
            .ok_or(talos_core::Error::ServiceNotUpdatable { app_id, service_id })?;

        let target = ImageRef::new(current.repository, new_tag);
        state.set_image_for_service(app_id, service_id, &target)?;

        self.update(uuid, state).await
    }

    /// Single CAS attempt: commits `new_state` iff the stored version still
    /// equals `expected_version`.
    async fn try_commit(
        &self,
        uuid: &str,
        expected_version: u64,
        new_state: TargetState,
    ) -> Result<u64> {
        let mut documents = self.documents.write().await;
        let doc = documents
            .get_mut(uuid)
            .ok_or_else(|| StoreError::TargetStateNotFound {
                uuid: uuid.to_string(),
            })?;

        if doc.version != expected_version {
            return Err(StoreError::VersionConflict {
                uuid: uuid.to_string(),
                expected: expected_version,
                actual: doc.version,
            });
        }

        doc.state = new_state;
        doc.version += 1;
        doc.updated_at = Utc::now();
        Ok(doc.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talos_audit::MemorySink;
    use talos_core::{App, Service};

    fn service_with_publisher() -> (TargetStateService, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new(64));
        let publisher = Arc::new(EventPublisher::builder().with_sink(sink.clone()).build());
        (TargetStateService::new(publisher), sink)
    }

    fn redis_state(tag: &str) -> TargetState {
        TargetState::new().with_app(
            App::new(1002, "cache")
                .with_service(Service::new(1, "redis").with_image(format!("redis:{tag}"))),
        )
    }

    #[tokio::test]
    async fn test_get_missing_device() {
        let (service, _) = service_with_publisher();
        let err = service.get("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::TargetStateNotFound { .. }));
    }

    #[tokio::test]
    async fn test_init_and_get_with_etag() {
        let (service, _) = service_with_publisher();
        service
            .init_device("dev-1", redis_state("7-alpine"))
            .await
            .unwrap();

        let (doc, etag) = service.get("dev-1").await.unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(etag.len(), 64);

        // Repeated reads return an identical validator.
        let (_, etag2) = service.get("dev-1").await.unwrap();
        assert_eq!(etag, etag2);
    }

    #[tokio::test]
    async fn test_update_increments_version_and_publishes() {
        let (service, sink) = service_with_publisher();
        service
            .init_device("dev-1", redis_state("7-alpine"))
            .await
            .unwrap();

        let version = service
            .update("dev-1", redis_state("7.2-alpine"))
            .await
            .unwrap();
        assert_eq!(version, 2);

        let events = sink.events_of_type("target_state.updated");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["version"], 2);
    }

    #[tokio::test]
    async fn test_equal_hash_update_is_noop() {
        let (service, sink) = service_with_publisher();
        service
            .init_device("dev-1", redis_state("7-alpine"))
            .await
            .unwrap();

        let version = service
            .update("dev-1", redis_state("7-alpine"))
            .await
            .unwrap();
        assert_eq!(version, 1);
        assert!(sink.events().is_empty());

        let (doc, _) = service.get("dev-1").await.unwrap();
        assert_eq!(doc.version, 1);
    }

    #[tokio::test]
    async fn test_etag_changes_after_update() {
        let (service, _) = service_with_publisher();
        service
            .init_device("dev-1", redis_state("7-alpine"))
            .await
            .unwrap();

        let (_, etag_before) = service.get("dev-1").await.unwrap();
        service
            .set_image_for_service("dev-1", 1002, 1, "7.2-alpine")
            .await
            .unwrap();
        let (_, etag_after) = service.get("dev-1").await.unwrap();
        assert_ne!(etag_before, etag_after);
    }

    #[tokio::test]
    async fn test_set_image_for_service_rewrites_both_fields() {
        let (service, _) = service_with_publisher();
        let state = TargetState::new().with_app(
            App::new(1002, "cache").with_service(
                Service::new(1, "redis")
                    .with_image("redis:7-alpine")
                    .with_config_image("redis:7-alpine"),
            ),
        );
        service.init_device("dev-1", state).await.unwrap();

        let version = service
            .set_image_for_service("dev-1", 1002, 1, "7.2-alpine")
            .await
            .unwrap();
        assert_eq!(version, 2);

        let (doc, _) = service.get("dev-1").await.unwrap();
        let svc = doc.state.apps[&1002].service(1).unwrap();
        assert_eq!(svc.image_name.as_deref(), Some("redis:7.2-alpine"));
        assert_eq!(
            doc.state.apps[&1002].service(1).unwrap().config["image"],
            serde_json::json!("redis:7.2-alpine")
        );
    }

    #[tokio::test]
    async fn test_set_image_for_service_same_tag_is_noop() {
        let (service, sink) = service_with_publisher();
        service
            .init_device("dev-1", redis_state("7-alpine"))
            .await
            .unwrap();

        let version = service
            .set_image_for_service("dev-1", 1002, 1, "7-alpine")
            .await
            .unwrap();
        assert_eq!(version, 1);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_set_image_for_missing_path() {
        let (service, _) = service_with_publisher();
        service
            .init_device("dev-1", redis_state("7-alpine"))
            .await
            .unwrap();

        let err = service
            .set_image_for_service("dev-1", 9999, 1, "7.2")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Core(talos_core::Error::ServicePathNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_image_for_service_without_image_field() {
        let (service, _) = service_with_publisher();
        let state = TargetState::new()
            .with_app(App::new(1002, "cache").with_service(Service::new(1, "bare")));
        service.init_device("dev-1", state).await.unwrap();

        let err = service
            .set_image_for_service("dev-1", 1002, 1, "7.2")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Core(talos_core::Error::ServiceNotUpdatable { .. })
        ));
    }

    #[tokio::test]
    async fn test_all_is_uuid_sorted() {
        let (service, _) = service_with_publisher();
        service
            .init_device("dev-b", redis_state("7"))
            .await
            .unwrap();
        service
            .init_device("dev-a", redis_state("7"))
            .await
            .unwrap();

        let all = service.all().await;
        assert_eq!(all[0].0, "dev-a");
        assert_eq!(all[1].0, "dev-b");
    }

    #[tokio::test]
    async fn test_versions_strictly_increase_across_updates() {
        let (service, _) = service_with_publisher();
        service
            .init_device("dev-1", redis_state("1"))
            .await
            .unwrap();

        let mut last = 1;
        for tag in ["2", "3", "4"] {
            let version = service.update("dev-1", redis_state(tag)).await.unwrap();
            assert!(version > last);
            last = version;
        }
    }
}

//! The admission gate.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use talos_audit::{DomainEvent, EventPublisher};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{RegistryError, Result};
use crate::types::{ApprovalRequest, ImageEntry, ImageStatus, ImageTag};

/// Admission decision for a pushed `(image, tag)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Cleared for rollout planning.
    Admitted,

    /// The image is unknown or not yet approved; an approval request is on
    /// file.
    PendingApproval,

    /// Refused outright.
    Rejected {
        /// Refusal reason.
        reason: String,
    },

    /// Refused because the tag is deprecated.
    Deprecated,
}

impl Admission {
    /// Returns true if rollout planning may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Configuration for the admission gate.
#[derive(Debug, Clone, Default)]
pub struct GateConfig {
    /// Repository prefixes exempt from admission (first-party images).
    pub internal_prefixes: Vec<String>,
}

impl GateConfig {
    /// Adds an internal namespace prefix.
    #[must_use]
    pub fn with_internal_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.internal_prefixes.push(prefix.into());
        self
    }
}

/// One image entry together with its tag rows.
#[derive(Debug, Clone)]
struct ImageRecord {
    entry: ImageEntry,
    tags: BTreeMap<String, ImageTag>,
}

/// The approved-image registry and its admission gate.
pub struct RegistryGate {
    config: GateConfig,
    images: RwLock<HashMap<(String, String), ImageRecord>>,
    approvals: RwLock<Vec<ApprovalRequest>>,
    publisher: Option<Arc<EventPublisher>>,
}

impl RegistryGate {
    /// Creates an empty gate.
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            images: RwLock::new(HashMap::new()),
            approvals: RwLock::new(Vec::new()),
            publisher: None,
        }
    }

    /// Attaches an event publisher for approval-request events.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Runs the admission rules for a pushed `(image, tag)` pair.
    ///
    /// Rules, in order: internal-namespace bypass; image entry lookup
    /// (unknown or unapproved → pending approval); tag lookup (unknown →
    /// auto-insert and admit; deprecated → refuse).
    pub async fn admit(&self, registry: &str, image: &str, tag: &str) -> Admission {
        if self
            .config
            .internal_prefixes
            .iter()
            .any(|p| image.starts_with(p.as_str()))
        {
            debug!(image = %image, "internal namespace, bypassing admission");
            return Admission::Admitted;
        }

        let key = (registry.to_string(), image.to_string());
        let mut images = self.images.write().await;

        let Some(record) = images.get_mut(&key) else {
            drop(images);
            self.open_approval_request(image, tag).await;
            return Admission::PendingApproval;
        };

        if record.entry.status != ImageStatus::Approved {
            return Admission::PendingApproval;
        }

        match record.tags.get(tag) {
            None => {
                // New tag under an approved image: record it and let it through.
                record.tags.insert(tag.to_string(), ImageTag::new(tag));
                info!(image = %image, tag = %tag, "auto-added tag under approved image");
                Admission::Admitted
            }
            Some(t) if t.is_deprecated => Admission::Deprecated,
            Some(_) => Admission::Admitted,
        }
    }

    /// Opens an approval request unless one is already on file for the
    /// image. Idempotent on webhook retries.
    async fn open_approval_request(&self, image: &str, tag: &str) {
        let mut approvals = self.approvals.write().await;
        if approvals.iter().any(|r| r.image_name == image) {
            debug!(image = %image, "approval request already on file");
            return;
        }
        approvals.push(ApprovalRequest {
            image_name: image.to_string(),
            tag: tag.to_string(),
            requested_at: chrono::Utc::now(),
        });
        info!(image = %image, tag = %tag, "opened approval request");
        if let Some(publisher) = &self.publisher {
            publisher.publish(DomainEvent::image_approval_requested(image, tag));
        }
    }

    // Admin operations -------------------------------------------------------

    /// Inserts or replaces an image entry, keeping existing tag rows.
    pub async fn upsert_entry(&self, entry: ImageEntry) {
        let key = (entry.registry.clone(), entry.image_name.clone());
        let mut images = self.images.write().await;
        match images.get_mut(&key) {
            Some(record) => record.entry = entry,
            None => {
                images.insert(
                    key,
                    ImageRecord {
                        entry,
                        tags: BTreeMap::new(),
                    },
                );
            }
        }
    }

    /// Sets an entry's review status. Approval clears any open approval
    /// request for the image.
    pub async fn set_status(&self, registry: &str, image: &str, status: ImageStatus) -> Result<()> {
        let key = (registry.to_string(), image.to_string());
        let mut images = self.images.write().await;
        let record = images.get_mut(&key).ok_or_else(|| RegistryError::EntryNotFound {
            registry: registry.to_string(),
            image: image.to_string(),
        })?;
        record.entry.status = status;
        drop(images);

        if status == ImageStatus::Approved {
            let mut approvals = self.approvals.write().await;
            approvals.retain(|r| r.image_name != image);
        }
        Ok(())
    }

    /// Adds a tag row under an image.
    pub async fn add_tag(&self, registry: &str, image: &str, tag: ImageTag) -> Result<()> {
        let key = (registry.to_string(), image.to_string());
        let mut images = self.images.write().await;
        let record = images.get_mut(&key).ok_or_else(|| RegistryError::EntryNotFound {
            registry: registry.to_string(),
            image: image.to_string(),
        })?;
        record.tags.insert(tag.tag.clone(), tag);
        Ok(())
    }

    /// Marks a tag deprecated.
    pub async fn deprecate_tag(&self, registry: &str, image: &str, tag: &str) -> Result<()> {
        let key = (registry.to_string(), image.to_string());
        let mut images = self.images.write().await;
        let record = images.get_mut(&key).ok_or_else(|| RegistryError::EntryNotFound {
            registry: registry.to_string(),
            image: image.to_string(),
        })?;
        let row = record
            .tags
            .get_mut(tag)
            .ok_or_else(|| RegistryError::TagNotFound {
                image: image.to_string(),
                tag: tag.to_string(),
            })?;
        row.is_deprecated = true;
        Ok(())
    }

    /// Marks a tag recommended, clearing the flag from the image's other
    /// tags (at most one recommended tag per image).
    pub async fn recommend_tag(&self, registry: &str, image: &str, tag: &str) -> Result<()> {
        let key = (registry.to_string(), image.to_string());
        let mut images = self.images.write().await;
        let record = images.get_mut(&key).ok_or_else(|| RegistryError::EntryNotFound {
            registry: registry.to_string(),
            image: image.to_string(),
        })?;
        if !record.tags.contains_key(tag) {
            return Err(RegistryError::TagNotFound {
                image: image.to_string(),
                tag: tag.to_string(),
            });
        }
        for (name, row) in &mut record.tags {
            row.is_recommended = name == tag;
        }
        Ok(())
    }

    /// Returns an entry with its tags.
    pub async fn get_entry(&self, registry: &str, image: &str) -> Result<(ImageEntry, Vec<ImageTag>)> {
        let key = (registry.to_string(), image.to_string());
        let images = self.images.read().await;
        let record = images.get(&key).ok_or_else(|| RegistryError::EntryNotFound {
            registry: registry.to_string(),
            image: image.to_string(),
        })?;
        Ok((record.entry.clone(), record.tags.values().cloned().collect()))
    }

    /// Lists all entries, sorted by `(registry, image_name)`.
    pub async fn list_entries(&self) -> Vec<ImageEntry> {
        let images = self.images.read().await;
        let mut all: Vec<ImageEntry> = images.values().map(|r| r.entry.clone()).collect();
        all.sort_by(|a, b| {
            (a.registry.as_str(), a.image_name.as_str())
                .cmp(&(b.registry.as_str(), b.image_name.as_str()))
        });
        all
    }

    /// Lists open approval requests, oldest first.
    pub async fn list_approval_requests(&self) -> Vec<ApprovalRequest> {
        self.approvals.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> RegistryGate {
        RegistryGate::new(GateConfig::default())
    }

    async fn approved_redis(gate: &RegistryGate) {
        gate.upsert_entry(ImageEntry::new("docker.io", "redis").with_status(ImageStatus::Approved))
            .await;
    }

    #[tokio::test]
    async fn test_internal_namespace_bypasses_registry() {
        let gate = RegistryGate::new(GateConfig::default().with_internal_prefix("talos/"));
        let admission = gate.admit("docker.io", "talos/agent", "1.0").await;
        assert_eq!(admission, Admission::Admitted);

        // Nothing was recorded for the internal image.
        assert!(gate.list_entries().await.is_empty());
        assert!(gate.list_approval_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_image_opens_approval_request() {
        let gate = gate();
        let admission = gate.admit("docker.io", "memcached", "latest").await;
        assert_eq!(admission, Admission::PendingApproval);

        let requests = gate.list_approval_requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].image_name, "memcached");
        assert_eq!(requests[0].tag, "latest");
    }

    #[tokio::test]
    async fn test_approval_request_is_idempotent() {
        let gate = gate();
        assert_eq!(
            gate.admit("docker.io", "memcached", "latest").await,
            Admission::PendingApproval
        );
        assert_eq!(
            gate.admit("docker.io", "memcached", "1.6").await,
            Admission::PendingApproval
        );

        // Still one request for the image.
        assert_eq!(gate.list_approval_requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unapproved_entry_is_pending() {
        let gate = gate();
        gate.upsert_entry(ImageEntry::new("docker.io", "redis"))
            .await;
        assert_eq!(
            gate.admit("docker.io", "redis", "7.2").await,
            Admission::PendingApproval
        );

        gate.upsert_entry(
            ImageEntry::new("docker.io", "redis").with_status(ImageStatus::Rejected),
        )
        .await;
        assert_eq!(
            gate.admit("docker.io", "redis", "7.2").await,
            Admission::PendingApproval
        );
    }

    #[tokio::test]
    async fn test_unknown_tag_auto_added_and_admitted() {
        let gate = gate();
        approved_redis(&gate).await;

        assert_eq!(
            gate.admit("docker.io", "redis", "7.2-alpine").await,
            Admission::Admitted
        );

        let (_, tags) = gate.get_entry("docker.io", "redis").await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].tag, "7.2-alpine");
        assert!(!tags[0].is_recommended);
        assert!(!tags[0].is_deprecated);

        // A second admit does not duplicate the tag row.
        gate.admit("docker.io", "redis", "7.2-alpine").await;
        let (_, tags) = gate.get_entry("docker.io", "redis").await.unwrap();
        assert_eq!(tags.len(), 1);
    }

    #[tokio::test]
    async fn test_deprecated_tag_refused() {
        let gate = gate();
        approved_redis(&gate).await;
        gate.add_tag("docker.io", "redis", ImageTag::new("6-alpine"))
            .await
            .unwrap();
        gate.deprecate_tag("docker.io", "redis", "6-alpine")
            .await
            .unwrap();

        assert_eq!(
            gate.admit("docker.io", "redis", "6-alpine").await,
            Admission::Deprecated
        );
    }

    #[tokio::test]
    async fn test_known_good_tag_admitted() {
        let gate = gate();
        approved_redis(&gate).await;
        gate.add_tag("docker.io", "redis", ImageTag::new("7-alpine"))
            .await
            .unwrap();

        assert!(gate.admit("docker.io", "redis", "7-alpine").await.is_admitted());
    }

    #[tokio::test]
    async fn test_approving_image_clears_request() {
        let gate = gate();
        gate.admit("docker.io", "memcached", "latest").await;
        assert_eq!(gate.list_approval_requests().await.len(), 1);

        gate.upsert_entry(ImageEntry::new("docker.io", "memcached"))
            .await;
        gate.set_status("docker.io", "memcached", ImageStatus::Approved)
            .await
            .unwrap();

        assert!(gate.list_approval_requests().await.is_empty());
        assert!(gate
            .admit("docker.io", "memcached", "latest")
            .await
            .is_admitted());
    }

    #[tokio::test]
    async fn test_recommend_tag_is_exclusive() {
        let gate = gate();
        approved_redis(&gate).await;
        gate.add_tag("docker.io", "redis", ImageTag::new("7-alpine"))
            .await
            .unwrap();
        gate.add_tag("docker.io", "redis", ImageTag::new("7.2-alpine"))
            .await
            .unwrap();

        gate.recommend_tag("docker.io", "redis", "7-alpine")
            .await
            .unwrap();
        gate.recommend_tag("docker.io", "redis", "7.2-alpine")
            .await
            .unwrap();

        let (_, tags) = gate.get_entry("docker.io", "redis").await.unwrap();
        let recommended: Vec<&str> = tags
            .iter()
            .filter(|t| t.is_recommended)
            .map(|t| t.tag.as_str())
            .collect();
        assert_eq!(recommended, vec!["7.2-alpine"]);
    }

    #[tokio::test]
    async fn test_set_status_missing_entry() {
        let gate = gate();
        let err = gate
            .set_status("docker.io", "nope", ImageStatus::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::EntryNotFound { .. }));
    }

    #[tokio::test]
    async fn test_approval_event_published() {
        use talos_audit::MemorySink;

        let sink = Arc::new(MemorySink::new(16));
        let publisher = Arc::new(EventPublisher::builder().with_sink(sink.clone()).build());
        let gate = RegistryGate::new(GateConfig::default()).with_publisher(publisher);

        gate.admit("docker.io", "memcached", "latest").await;

        let events = sink.events_of_type("image.approval_requested");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].aggregate_id, "memcached");
    }
}

//! Registry record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Review status of an image entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    /// Awaiting review.
    Pending,
    /// Approved for rollouts.
    Approved,
    /// Rejected by review.
    Rejected,
}

impl ImageStatus {
    /// Returns a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A registry image entry, unique per `(registry, image_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Registry host.
    pub registry: String,

    /// Namespace portion of the image name, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Image name.
    pub image_name: String,

    /// Review status.
    pub status: ImageStatus,

    /// Free-form category label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Upstream-official image.
    #[serde(default)]
    pub is_official: bool,

    /// When the entry was created.
    pub created_at: DateTime<Utc>,
}

impl ImageEntry {
    /// Creates a pending entry.
    pub fn new(registry: impl Into<String>, image_name: impl Into<String>) -> Self {
        let image_name = image_name.into();
        let namespace = image_name
            .rsplit_once('/')
            .map(|(ns, _)| ns.to_string());
        Self {
            registry: registry.into(),
            namespace,
            image_name,
            status: ImageStatus::Pending,
            category: None,
            is_official: false,
            created_at: Utc::now(),
        }
    }

    /// Sets the review status.
    pub fn with_status(mut self, status: ImageStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the category label.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Marks the image as upstream-official.
    pub fn official(mut self) -> Self {
        self.is_official = true;
        self
    }
}

/// A tag row under an image entry, unique per `(image, tag)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTag {
    /// Tag string.
    pub tag: String,

    /// Deprecated tags are refused by admission.
    #[serde(default)]
    pub is_deprecated: bool,

    /// At most one recommended tag per image.
    #[serde(default)]
    pub is_recommended: bool,

    /// When the tag was first seen.
    pub created_at: DateTime<Utc>,
}

impl ImageTag {
    /// Creates a plain tag row.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            is_deprecated: false,
            is_recommended: false,
            created_at: Utc::now(),
        }
    }
}

/// An open approval request for an unknown image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Image that triggered the request.
    pub image_name: String,

    /// Tag seen on the triggering push.
    pub tag: String,

    /// When the request was opened.
    pub requested_at: DateTime<Utc>,
}

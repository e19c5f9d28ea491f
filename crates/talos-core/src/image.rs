//! Container image references.
//!
//! Target-state documents carry image references in two places for
//! historical reasons: a service-level `imageName` field and a nested
//! `config.image` entry. Readers must accept either; writers must rewrite
//! whichever fields are populated and never normalize one into the other.
//! This module provides the parsed [`ImageRef`] form and the [`ImageSlot`]
//! marker recording where a reference was found.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A parsed container image reference.
///
/// # Examples
///
/// ```rust
/// use talos_core::ImageRef;
///
/// let image = ImageRef::parse("registry.example.com/acme/redis:7-alpine").unwrap();
/// assert_eq!(image.repository, "registry.example.com/acme/redis");
/// assert_eq!(image.tag, "7-alpine");
/// assert_eq!(image.base_name(), "redis");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Repository path, including any registry host and namespace.
    pub repository: String,

    /// Image tag. Defaults to `latest` when the reference carries none.
    pub tag: String,
}

impl ImageRef {
    /// Parses an image reference string.
    ///
    /// The tag separator is the last `:` that appears after the last `/`,
    /// so registry hosts with ports (`registry:5000/app`) parse correctly.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::InvalidImageReference {
                value: value.to_string(),
            });
        }

        let last_slash = value.rfind('/');
        let tag_colon = match value.rfind(':') {
            Some(idx) if last_slash.is_none_or(|s| idx > s) => Some(idx),
            _ => None,
        };

        let (repository, tag) = match tag_colon {
            Some(idx) => (&value[..idx], &value[idx + 1..]),
            None => (value, "latest"),
        };

        if repository.is_empty() || tag.is_empty() {
            return Err(Error::InvalidImageReference {
                value: value.to_string(),
            });
        }

        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Creates a reference from a repository and tag pair.
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Returns the final path segment of the repository.
    ///
    /// `registry.example.com/acme/redis` and `redis` both yield `redis`.
    pub fn base_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }

    /// Returns true if this reference names the given image.
    ///
    /// Matches on the full repository path or, failing that, on the base
    /// name of both sides, so `acme/redis` matches a webhook for `redis`.
    pub fn names_image(&self, image_name: &str) -> bool {
        if self.repository == image_name {
            return true;
        }
        let other_base = image_name.rsplit('/').next().unwrap_or(image_name);
        self.base_name() == other_base
    }

    /// Returns this reference with a different tag.
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            repository: self.repository.clone(),
            tag: tag.into(),
        }
    }

    /// Returns true if the repository lives under any of the given
    /// namespace prefixes (first-party images exempt from admission).
    pub fn in_namespaces(&self, prefixes: &[String]) -> bool {
        prefixes.iter().any(|p| self.repository.starts_with(p))
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Where an image reference was found on a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSlot {
    /// Only the service-level `imageName` field is populated.
    ServiceField,

    /// Only the nested `config.image` entry is populated.
    ConfigField,

    /// Both fields are populated (they are kept in sync on write).
    Both,
}

//! Error types for the store crate.

use talos_core::ErrorKind;
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No such device.
    #[error("device '{uuid}' not found")]
    DeviceNotFound {
        /// Device uuid.
        uuid: String,
    },

    /// No target-state document for the device.
    #[error("no target state for device '{uuid}'")]
    TargetStateNotFound {
        /// Device uuid.
        uuid: String,
    },

    /// Optimistic version check failed after exhausting retries.
    #[error("version conflict on device '{uuid}': expected {expected}, found {actual}")]
    VersionConflict {
        /// Device uuid.
        uuid: String,
        /// Version the writer expected.
        expected: u64,
        /// Version actually stored.
        actual: u64,
    },

    /// No such update policy.
    #[error("update policy '{id}' not found")]
    PolicyNotFound {
        /// Policy id.
        id: String,
    },

    /// No such application template.
    #[error("app template '{slug}' not found")]
    TemplateNotFound {
        /// Template slug.
        slug: String,
    },

    /// A template slug is already taken.
    #[error("app template slug '{slug}' already exists")]
    TemplateSlugTaken {
        /// Template slug.
        slug: String,
    },

    /// Core domain error (validation, image rewrite, hashing).
    #[error(transparent)]
    Core(#[from] talos_core::Error),
}

impl StoreError {
    /// Maps this error onto the API error-kind table.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceNotFound { .. }
            | Self::TargetStateNotFound { .. }
            | Self::PolicyNotFound { .. }
            | Self::TemplateNotFound { .. } => ErrorKind::NotFound,
            Self::VersionConflict { .. } | Self::TemplateSlugTaken { .. } => ErrorKind::Conflict,
            Self::Core(talos_core::Error::Serialization(_)) => ErrorKind::Internal,
            Self::Core(_) => ErrorKind::BadRequest,
        }
    }
}

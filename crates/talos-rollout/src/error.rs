//! Error types for the rollout crate.

use talos_core::ErrorKind;
use thiserror::Error;

/// Result type alias for rollout operations.
pub type Result<T> = std::result::Result<T, RolloutError>;

/// Errors that can occur in the rollout control loop.
#[derive(Error, Debug)]
pub enum RolloutError {
    /// No such rollout.
    #[error("rollout '{rollout_id}' not found")]
    RolloutNotFound {
        /// Rollout id.
        rollout_id: String,
    },

    /// No row for the device in the rollout.
    #[error("device '{device_uuid}' has no row in rollout '{rollout_id}'")]
    RowNotFound {
        /// Rollout id.
        rollout_id: String,
        /// Device uuid.
        device_uuid: String,
    },

    /// An active rollout already exists for the image with the same tag.
    #[error("rollout '{rollout_id}' already active for this image and tag")]
    DuplicateRollout {
        /// The existing rollout's id.
        rollout_id: String,
    },

    /// An active rollout for the image blocks a new one with another tag.
    #[error("image is locked by active rollout '{rollout_id}'")]
    ImageLocked {
        /// The blocking rollout's id.
        rollout_id: String,
    },

    /// A manual batch advance was requested before the current batch
    /// finished.
    #[error("batch {batch} of rollout '{rollout_id}' is not complete")]
    BatchNotComplete {
        /// Rollout id.
        rollout_id: String,
        /// The incomplete batch.
        batch: u32,
    },

    /// No enabled policy matched the pushed image.
    #[error("no update policy matches '{image}:{tag}'")]
    PolicyNotMatched {
        /// Image name.
        image: String,
        /// Tag.
        tag: String,
    },

    /// The admission gate refused the push.
    #[error("image '{image}:{tag}' not approved: {reason}")]
    NotAdmitted {
        /// Image name.
        image: String,
        /// Tag.
        tag: String,
        /// Gate refusal reason.
        reason: String,
        /// The tag is refused because it is deprecated.
        deprecated: bool,
    },

    /// The webhook payload could not be parsed.
    #[error("malformed webhook payload from '{provider}': {reason}")]
    MalformedPayload {
        /// Provider name.
        provider: String,
        /// Parse failure reason.
        reason: String,
    },

    /// Core domain error (state machine violations, validation).
    #[error(transparent)]
    Core(#[from] talos_core::Error),

    /// Store error.
    #[error(transparent)]
    Store(#[from] talos_store::StoreError),
}

impl RolloutError {
    /// Maps this error onto the API error-kind table.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RolloutNotFound { .. } | Self::RowNotFound { .. } => ErrorKind::NotFound,
            Self::DuplicateRollout { .. } | Self::ImageLocked { .. } => ErrorKind::Conflict,
            Self::PolicyNotMatched { .. } => ErrorKind::PolicyNotMatched,
            Self::NotAdmitted {
                deprecated: true, ..
            } => ErrorKind::ImageTagDeprecated,
            Self::NotAdmitted { .. } => ErrorKind::ImageNotApproved,
            Self::MalformedPayload { .. } => ErrorKind::BadRequest,
            Self::BatchNotComplete { .. }
            | Self::Core(talos_core::Error::InvalidTransition { .. }) => {
                ErrorKind::RolloutInvalidTransition
            }
            Self::Core(_) => ErrorKind::BadRequest,
            Self::Store(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            RolloutError::RolloutNotFound {
                rollout_id: "ro-1".to_string()
            }
            .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            RolloutError::DuplicateRollout {
                rollout_id: "ro-1".to_string()
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            RolloutError::PolicyNotMatched {
                image: "redis".to_string(),
                tag: "7".to_string()
            }
            .kind(),
            ErrorKind::PolicyNotMatched
        );
        assert_eq!(
            RolloutError::NotAdmitted {
                image: "redis".to_string(),
                tag: "6".to_string(),
                reason: "deprecated".to_string(),
                deprecated: true,
            }
            .kind(),
            ErrorKind::ImageTagDeprecated
        );
        assert_eq!(
            RolloutError::Core(talos_core::Error::InvalidTransition {
                from: "pending".to_string(),
                to: "paused".to_string()
            })
            .kind(),
            ErrorKind::RolloutInvalidTransition
        );
    }

    #[test]
    fn test_error_display() {
        let err = RolloutError::PolicyNotMatched {
            image: "memcached".to_string(),
            tag: "latest".to_string(),
        };
        assert_eq!(err.to_string(), "no update policy matches 'memcached:latest'");
    }
}

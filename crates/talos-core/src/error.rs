//! Error types for Talos core operations.
//!
//! This module defines the error type used throughout `talos-core` as well
//! as the stable machine-readable error kinds surfaced by the HTTP API.

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Talos core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A target-state document failed structural validation.
    #[error("invalid target state document: {reason}")]
    InvalidDocument {
        /// Reason for the validation failure.
        reason: String,
    },

    /// An image reference string could not be parsed.
    #[error("invalid image reference '{value}'")]
    InvalidImageReference {
        /// The offending reference string.
        value: String,
    },

    /// A service was addressed that carries no image field to rewrite.
    #[error("service {service_id} in app {app_id} has no image field to update")]
    ServiceNotUpdatable {
        /// Application identifier.
        app_id: u32,
        /// Service identifier.
        service_id: u32,
    },

    /// The addressed app or service does not exist in the document.
    #[error("no service {service_id} in app {app_id}")]
    ServicePathNotFound {
        /// Application identifier.
        app_id: u32,
        /// Service identifier.
        service_id: u32,
    },

    /// An update-policy glob pattern failed to compile.
    #[error("invalid image pattern '{pattern}': {reason}")]
    InvalidImagePattern {
        /// The offending pattern.
        pattern: String,
        /// Reason for the failure.
        reason: String,
    },

    /// An update policy failed validation.
    #[error("invalid update policy '{id}': {reason}")]
    InvalidPolicy {
        /// Policy id.
        id: String,
        /// Reason for the failure.
        reason: String,
    },

    /// A rollout state transition was requested that the state machine forbids.
    #[error("invalid rollout transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stable machine-readable error kinds surfaced by the HTTP API.
///
/// Each kind has a fixed wire string and an associated HTTP status code, so
/// callers can branch on kind without parsing error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid device credential.
    Unauthenticated,

    /// Authenticated, but not permitted.
    Forbidden,

    /// Target resource absent.
    NotFound,

    /// Optimistic version mismatch or duplicate active rollout.
    Conflict,

    /// Admission gate refusal.
    ImageNotApproved,

    /// Deprecation refusal.
    ImageTagDeprecated,

    /// Webhook image has no active policy.
    PolicyNotMatched,

    /// Malformed payload or missing required field.
    BadRequest,

    /// Requested rollout transition is not legal in the current state.
    RolloutInvalidTransition,

    /// A bounded health check exceeded its deadline.
    HealthCheckTimeout,

    /// Unexpected failure; carries a correlation id at the API boundary.
    Internal,
}

impl ErrorKind {
    /// Returns the stable wire identifier for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::ImageNotApproved => "image-not-approved",
            Self::ImageTagDeprecated => "image-tag-deprecated",
            Self::PolicyNotMatched => "policy-not-matched",
            Self::BadRequest => "bad-request",
            Self::RolloutInvalidTransition => "rollout-invalid-transition",
            Self::HealthCheckTimeout => "health-check-timeout",
            Self::Internal => "internal",
        }
    }

    /// Returns the HTTP status code used when surfacing this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthenticated => 401,
            Self::Forbidden | Self::ImageNotApproved | Self::ImageTagDeprecated => 403,
            Self::NotFound => 404,
            Self::Conflict | Self::RolloutInvalidTransition => 409,
            Self::PolicyNotMatched | Self::BadRequest => 400,
            Self::HealthCheckTimeout => 504,
            Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

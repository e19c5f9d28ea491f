//! API error surface.
//!
//! Every failure leaving the HTTP layer carries a stable machine-readable
//! kind plus a human-readable message. Internal errors are reported with a
//! correlation id only; details stay in the logs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use talos_core::ErrorKind;
use tracing::error;
use uuid::{Timestamp, Uuid};

/// An error ready to be rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    /// Machine-readable kind.
    pub kind: ErrorKind,

    /// Human-readable message.
    pub message: String,
}

/// Wire shape of an error response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

impl ApiError {
    /// Creates an error with an explicit kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Missing or invalid device credential.
    pub fn unauthenticated() -> Self {
        Self::new(ErrorKind::Unauthenticated, "invalid device credentials")
    }

    /// Authenticated but not permitted.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    /// Target resource absent.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Malformed request.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = if self.kind == ErrorKind::Internal {
            let correlation_id = Uuid::new_v7(Timestamp::now(uuid::NoContext)).to_string();
            error!(correlation_id = %correlation_id, message = %self.message, "internal error");
            ErrorBody {
                error: self.kind.as_str(),
                message: "internal error".to_string(),
                correlation_id: Some(correlation_id),
            }
        } else {
            ErrorBody {
                error: self.kind.as_str(),
                message: self.message,
                correlation_id: None,
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<talos_store::StoreError> for ApiError {
    fn from(e: talos_store::StoreError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<talos_rollout::RolloutError> for ApiError {
    fn from(e: talos_rollout::RolloutError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<talos_registry::RegistryError> for ApiError {
    fn from(e: talos_registry::RegistryError) -> Self {
        Self::new(ErrorKind::NotFound, e.to_string())
    }
}

impl From<talos_core::Error> for ApiError {
    fn from(e: talos_core::Error) -> Self {
        Self::new(ErrorKind::BadRequest, e.to_string())
    }
}

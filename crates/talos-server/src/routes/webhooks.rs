//! Registry webhook intake routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use talos_rollout::IntakeOutcome;

use crate::error::ApiError;
use crate::state::AppState;

/// Webhook routes.
pub fn router() -> Router<AppState> {
    Router::new().route("/registry/:provider", post(receive))
}

/// `POST /webhooks/registry/{provider}` — registry push notification.
async fn receive(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    let outcome = state.intake.receive(&provider, &payload).await?;
    let response = match outcome {
        IntakeOutcome::RolloutCreated(rollout) => (
            StatusCode::OK,
            Json(json!({ "rollout_id": rollout.id })),
        ),
        IntakeOutcome::DuplicateRollout(rollout_id) => (
            StatusCode::CONFLICT,
            Json(json!({ "rollout_id": rollout_id })),
        ),
        IntakeOutcome::NoAffectedDevices => (
            StatusCode::OK,
            Json(json!({ "rollout_id": Value::Null, "detail": "no affected devices" })),
        ),
    };
    Ok(response.into_response())
}

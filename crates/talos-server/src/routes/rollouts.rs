//! Admin rollout routes: listing, detail, and lifecycle commands.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

/// Rollout admin routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_rollouts))
        .route("/:id", get(get_rollout))
        .route("/:id/:op", post(rollout_command))
        .route("/:id/devices/:device_uuid/rollback", post(rollback_device))
}

/// `GET /rollouts` — all rollouts, newest first.
async fn list_rollouts(State(state): State<AppState>) -> Json<Value> {
    let rollouts = state.rollouts.list().await;
    Json(json!({ "rollouts": rollouts }))
}

/// `GET /rollouts/{id}` — plan, rows, and recent events.
async fn get_rollout(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let (rollout, rows) = state.rollouts.detail(&id).await?;
    let events = state.events.events_for_aggregate(&id);
    Ok(Json(json!({
        "rollout": rollout,
        "devices": rows,
        "events": events,
    })))
}

/// Optional body for lifecycle commands.
#[derive(Debug, Default, Deserialize)]
struct CommandBody {
    #[serde(default)]
    reason: Option<String>,
}

/// `POST /rollouts/{id}/{op}` — lifecycle commands.
///
/// Supported ops: `start`, `advance`, `pause`, `resume`, `cancel`,
/// `rollback`.
async fn rollout_command(
    State(state): State<AppState>,
    Path((id, op)): Path<(String, String)>,
    body: Option<Json<CommandBody>>,
) -> Result<Json<Value>, ApiError> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "admin request".to_string());

    let rollout = match op.as_str() {
        "start" => state.monitor.start(&id).await?,
        "advance" => state.monitor.advance(&id).await?,
        "pause" => state.monitor.pause(&id, &reason).await?,
        "resume" => state.monitor.resume(&id).await?,
        "cancel" => state.monitor.cancel(&id, &reason).await?,
        "rollback" => state.monitor.rollback_all(&id).await?,
        other => {
            return Err(ApiError::bad_request(format!(
                "unknown rollout operation '{other}'"
            )));
        }
    };
    Ok(Json(json!({ "rollout": rollout })))
}

/// `POST /rollouts/{id}/devices/{uuid}/rollback` — single-device rollback.
async fn rollback_device(
    State(state): State<AppState>,
    Path((id, device_uuid)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let result = state.monitor.rollback_device(&id, &device_uuid).await?;
    Ok(Json(json!({
        "device_uuid": device_uuid,
        "state": result,
    })))
}

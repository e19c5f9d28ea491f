//! The reconciliation endpoint: the polling contract between device and
//! control plane.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use axum::{Json, Router};
use serde_json::json;
use talos_audit::DomainEvent;
use talos_core::CurrentStateReport;

use crate::auth::authenticate_device;
use crate::error::ApiError;
use crate::state::AppState;

/// Reconciliation routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:uuid/state", get(get_target_state))
        .route("/state", patch(report_current_state))
}

/// `GET /device/{uuid}/state` — poll target state with ETag revalidation.
async fn get_target_state(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let device = authenticate_device(&state, &headers).await?;
    if device.uuid != uuid {
        return Err(ApiError::forbidden("device may only read its own state"));
    }

    mark_device_seen(&state, &uuid).await?;

    let (doc, etag) = state.target_state.get(&uuid).await?;

    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());
    if if_none_match == Some(etag.as_str()) {
        return Ok((
            StatusCode::NOT_MODIFIED,
            [(header::ETAG, etag)],
        )
            .into_response());
    }

    let body = json!({ uuid: doc.state });
    Ok((StatusCode::OK, [(header::ETAG, etag)], Json(body)).into_response())
}

/// `PATCH /device/state` — accept a current-state report.
async fn report_current_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let device = authenticate_device(&state, &headers).await?;

    let map: BTreeMap<String, serde_json::Value> = serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(format!("malformed report: {e}")))?;
    if map.is_empty() {
        return Err(ApiError::bad_request("report carries no device entry"));
    }
    if map.keys().any(|k| k != &device.uuid) {
        return Err(ApiError::forbidden(
            "device may only report its own state",
        ));
    }
    let raw = map
        .into_values()
        .next()
        .ok_or_else(|| ApiError::bad_request("report carries no device entry"))?;
    let report: CurrentStateReport = serde_json::from_value(raw)
        .map_err(|e| ApiError::bad_request(format!("malformed report: {e}")))?;

    mark_device_seen(&state, &device.uuid).await?;

    state.current_state.apply_report(&device.uuid, &report).await;
    let converged = state
        .rollouts
        .record_device_report(&device.uuid, &report)
        .await;

    Ok(Json(json!({ "status": "ok", "rollouts_updated": converged })).into_response())
}

/// Stamps `last_seen` and emits `device.online` on an offline→online
/// transition.
async fn mark_device_seen(state: &AppState, uuid: &str) -> Result<(), ApiError> {
    if let Some(offline_for) = state.devices.mark_seen(uuid).await? {
        state
            .publisher
            .publish(DomainEvent::device_online(uuid, offline_for.num_seconds()));
    }
    Ok(())
}

//! Admin fleet routes: device provisioning, activation, templates, and
//! the fleet summary.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use talos_core::{App, AppTemplate, Device, TargetState};
use uuid::{Timestamp, Uuid};

use crate::auth::generate_api_key;
use crate::error::ApiError;
use crate::state::AppState;

/// Fleet admin routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/devices", get(list_devices).post(provision_device))
        .route("/devices/:uuid", get(get_device))
        .route("/devices/:uuid/active", post(set_device_active))
        .route("/templates", get(list_templates).post(create_template))
        .route("/summary", get(summary))
}

#[derive(Debug, Deserialize)]
struct ProvisionBody {
    name: String,
    #[serde(default)]
    device_type: Option<String>,
    #[serde(default)]
    fleet_id: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    /// Template the initial target state is seeded from, if any.
    #[serde(default)]
    template_slug: Option<String>,
}

/// `POST /fleet/devices` — provision a device.
///
/// Returns the device plus its API key; the key is shown exactly once.
async fn provision_device(
    State(state): State<AppState>,
    Json(body): Json<ProvisionBody>,
) -> Result<Json<Value>, ApiError> {
    if body.name.is_empty() {
        return Err(ApiError::bad_request("device name is required"));
    }

    let uuid = Uuid::new_v7(Timestamp::now(uuid::NoContext)).to_string();
    let (api_key, hash) = generate_api_key()?;

    let mut device = Device::new(uuid.clone(), body.name).with_api_key_hash(hash);
    if let Some(device_type) = body.device_type {
        device = device.with_type(device_type);
    }
    if let Some(fleet_id) = body.fleet_id {
        device = device.with_fleet(fleet_id);
    }
    for tag in body.tags {
        device = device.with_tag(tag);
    }

    // Seed the target state, from a template when requested.
    let mut target = TargetState::new();
    if let Some(slug) = body.template_slug {
        let template = state.templates.get_by_slug(&slug).await?;
        let mut app = App::new(template.app_id, template.name.clone());
        app.services = template.default_services.clone();
        target = target.with_app(app);
    }

    state.devices.upsert(device.clone()).await;
    state.target_state.init_device(uuid, target).await?;

    Ok(Json(json!({ "device": device, "api_key": api_key })))
}

/// `GET /fleet/devices`.
async fn list_devices(State(state): State<AppState>) -> Json<Value> {
    let devices = state.devices.list().await;
    Json(json!({ "devices": devices }))
}

/// `GET /fleet/devices/{uuid}` — device plus reporting status.
async fn get_device(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let device = state.devices.get(&uuid).await?;
    let (doc, etag) = state.target_state.get(&uuid).await?;
    let current = state.current_state.get(&uuid).await;
    Ok(Json(json!({
        "device": device,
        "target_version": doc.version,
        "target_etag": etag,
        "current_state": current,
    })))
}

#[derive(Debug, Deserialize)]
struct ActiveBody {
    active: bool,
}

/// `POST /fleet/devices/{uuid}/active` — flip the admin flag.
async fn set_device_active(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(body): Json<ActiveBody>,
) -> Result<Json<Value>, ApiError> {
    state.devices.set_active(&uuid, body.active).await?;
    Ok(Json(json!({ "uuid": uuid, "is_active": body.active })))
}

/// `GET /fleet/templates`.
async fn list_templates(State(state): State<AppState>) -> Json<Value> {
    let templates = state.templates.list().await;
    Json(json!({ "templates": templates }))
}

/// `POST /fleet/templates`.
async fn create_template(
    State(state): State<AppState>,
    Json(template): Json<AppTemplate>,
) -> Result<Json<Value>, ApiError> {
    if template.app_id < AppTemplate::USER_APP_ID_FLOOR {
        return Err(ApiError::bad_request(format!(
            "user app ids start at {}",
            AppTemplate::USER_APP_ID_FLOOR
        )));
    }
    state.templates.insert(template.clone()).await?;
    Ok(Json(json!({ "template": template })))
}

/// `GET /fleet/summary`.
async fn summary(State(state): State<AppState>) -> Json<Value> {
    let fleet = state.devices.summary().await;
    let active_rollouts = state
        .rollouts
        .list()
        .await
        .into_iter()
        .filter(|r| r.status.is_active())
        .count();
    Json(json!({
        "devices": fleet,
        "active_rollouts": active_rollouts,
    }))
}

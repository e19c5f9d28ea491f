//! Admin image-registry routes.
//!
//! Image names may contain slashes, so the mutating operations address
//! images through JSON bodies rather than path segments.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use talos_registry::{ImageEntry, ImageStatus, ImageTag};

use crate::error::ApiError;
use crate::state::AppState;

/// Image registry admin routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_images).post(create_image))
        .route("/approve", post(approve_image))
        .route("/reject", post(reject_image))
        .route("/tags", post(add_tag))
        .route("/tags/deprecate", post(deprecate_tag))
        .route("/tags/recommend", post(recommend_tag))
        .route("/approval-requests", get(list_approval_requests))
}

#[derive(Debug, Deserialize)]
struct CreateImageBody {
    registry: String,
    image_name: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    is_official: bool,
}

#[derive(Debug, Deserialize)]
struct ImageRefBody {
    registry: String,
    image_name: String,
}

#[derive(Debug, Deserialize)]
struct TagBody {
    registry: String,
    image_name: String,
    tag: String,
}

/// `GET /images`.
async fn list_images(State(state): State<AppState>) -> Json<Value> {
    let entries = state.gate.list_entries().await;
    Json(json!({ "images": entries }))
}

/// `POST /images` — create a pending entry.
async fn create_image(
    State(state): State<AppState>,
    Json(body): Json<CreateImageBody>,
) -> Result<Json<Value>, ApiError> {
    let mut entry = ImageEntry::new(body.registry, body.image_name);
    entry.category = body.category;
    entry.is_official = body.is_official;
    state.gate.upsert_entry(entry.clone()).await;
    Ok(Json(json!({ "image": entry })))
}

/// `POST /images/approve`.
async fn approve_image(
    State(state): State<AppState>,
    Json(body): Json<ImageRefBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .gate
        .set_status(&body.registry, &body.image_name, ImageStatus::Approved)
        .await?;
    Ok(Json(json!({ "image_name": body.image_name, "status": "approved" })))
}

/// `POST /images/reject`.
async fn reject_image(
    State(state): State<AppState>,
    Json(body): Json<ImageRefBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .gate
        .set_status(&body.registry, &body.image_name, ImageStatus::Rejected)
        .await?;
    Ok(Json(json!({ "image_name": body.image_name, "status": "rejected" })))
}

/// `POST /images/tags` — add a tag row.
async fn add_tag(
    State(state): State<AppState>,
    Json(body): Json<TagBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .gate
        .add_tag(&body.registry, &body.image_name, ImageTag::new(&body.tag))
        .await?;
    Ok(Json(json!({ "image_name": body.image_name, "tag": body.tag })))
}

/// `POST /images/tags/deprecate`.
async fn deprecate_tag(
    State(state): State<AppState>,
    Json(body): Json<TagBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .gate
        .deprecate_tag(&body.registry, &body.image_name, &body.tag)
        .await?;
    Ok(Json(json!({ "tag": body.tag, "is_deprecated": true })))
}

/// `POST /images/tags/recommend` — at most one recommended tag per image.
async fn recommend_tag(
    State(state): State<AppState>,
    Json(body): Json<TagBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .gate
        .recommend_tag(&body.registry, &body.image_name, &body.tag)
        .await?;
    Ok(Json(json!({ "tag": body.tag, "is_recommended": true })))
}

/// `GET /images/approval-requests`.
async fn list_approval_requests(State(state): State<AppState>) -> Json<Value> {
    let requests = state.gate.list_approval_requests().await;
    Json(json!({ "approval_requests": requests }))
}

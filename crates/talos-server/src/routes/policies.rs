//! Admin update-policy routes.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use talos_core::UpdatePolicy;
use uuid::{Timestamp, Uuid};

use crate::error::ApiError;
use crate::state::AppState;

/// Policy admin routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_policies).post(create_policy))
        .route("/:id", get(get_policy).put(update_policy).delete(delete_policy))
}

/// `GET /policies`.
async fn list_policies(State(state): State<AppState>) -> Json<Value> {
    let policies = state.policies.list().await;
    Json(json!({ "policies": policies }))
}

/// `POST /policies` — create a policy; an empty id gets generated.
async fn create_policy(
    State(state): State<AppState>,
    Json(mut policy): Json<UpdatePolicy>,
) -> Result<Json<Value>, ApiError> {
    if policy.id.is_empty() {
        policy.id = Uuid::new_v7(Timestamp::now(uuid::NoContext)).to_string();
    }
    state.policies.upsert(policy.clone()).await?;
    Ok(Json(json!({ "policy": policy })))
}

/// `GET /policies/{id}`.
async fn get_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let policy = state.policies.get(&id).await?;
    Ok(Json(json!({ "policy": policy })))
}

/// `PUT /policies/{id}` — replace a policy; the path id wins.
async fn update_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut policy): Json<UpdatePolicy>,
) -> Result<Json<Value>, ApiError> {
    // Replacing an unknown id is a create-with-id, matching upsert.
    policy.id = id;
    state.policies.upsert(policy.clone()).await?;
    Ok(Json(json!({ "policy": policy })))
}

/// `DELETE /policies/{id}`.
async fn delete_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.policies.remove(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

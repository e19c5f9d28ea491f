//! HTTP route modules.

use axum::Router;

use crate::state::AppState;

pub mod devices;
pub mod fleet;
pub mod images;
pub mod policies;
pub mod rollouts;
pub mod webhooks;

/// Assembles the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/device", devices::router())
        .nest("/webhooks", webhooks::router())
        .nest("/rollouts", rollouts::router())
        .nest("/policies", policies::router())
        .nest("/images", images::router())
        .nest("/fleet", fleet::router())
        .with_state(state)
}

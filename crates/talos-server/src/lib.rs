//! # Talos Server
//!
//! The HTTP surface and process orchestrator of the Talos control plane.
//!
//! Three groups of endpoints are served:
//!
//! - **Reconciliation** (`/device/…`): the device-facing polling contract —
//!   target state with ETag cache validation, current-state reports.
//! - **Webhook intake** (`/webhooks/registry/{provider}`): registry push
//!   notifications feeding the rollout control loop.
//! - **Admin** (`/rollouts`, `/policies`, `/images`, `/devices`): the
//!   minimal operator surface for rollout control and registry curation.
//!
//! The [`Orchestrator`] wires the stores, gate, and rollout monitor
//! together, supervises the background workers, and owns graceful
//! shutdown: on SIGTERM the monitor finishes its current tick, then exits.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
// Allow some clippy lints for initial development - will tighten before release
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use error::ApiError;
pub use orchestrator::Orchestrator;
pub use state::AppState;

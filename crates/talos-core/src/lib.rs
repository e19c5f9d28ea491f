//! # Talos Core
//!
//! Core types for the Talos fleet control plane.
//!
//! This crate provides the foundational data structures used throughout the
//! Talos ecosystem, including:
//!
//! - [`Device`] - A provisioned edge device and its admin/online flags
//! - [`TargetState`] - Declarative description of what a device should run
//! - [`CurrentStateReport`] - A device's self-report of what it is running
//! - [`ImageRef`] - Container image references with the dual-field quirk
//! - [`UpdatePolicy`] - Policy-driven rollout strategy configuration
//! - [`Rollout`] - A batched fleet migration and its state machine
//! - [`etag`] - Canonical-JSON hashing for cache validators
//!
//! ## Example
//!
//! ```rust
//! use talos_core::{App, Service, TargetState};
//!
//! let service = Service::new(1, "redis").with_image("redis:7-alpine");
//! let app = App::new(1002, "cache").with_service(service);
//! let state = TargetState::new().with_app(app);
//!
//! assert_eq!(state.apps.len(), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
// Allow some clippy lints for initial development - will tighten before release
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::module_name_repetitions)]

pub mod device;
pub mod error;
pub mod etag;
pub mod image;
pub mod policy;
pub mod rollout;
pub mod state;


// Re-export main types at crate root
pub use device::{AppTemplate, Device, DeviceUuid};
pub use error::{Error, ErrorKind, Result};
pub use image::{ImageRef, ImageSlot};
pub use policy::{DeviceFilter, HealthCheckKind, HealthProbeConfig, RolloutStrategy, UpdatePolicy};
pub use rollout::{
    DeviceRollout, DeviceRolloutState, Rollout, RolloutCounters, RolloutId, RolloutStatus,
};
pub use state::{
    App, AppReport, ContainerStatus, CurrentStateDocument, CurrentStateReport, Service,
    ServiceReport, SystemInfo, TargetState, TargetStateDocument,
};

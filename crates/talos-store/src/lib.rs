//! # Talos Store
//!
//! In-process, transactionally consistent storage for the Talos control
//! plane: devices, target-state documents, current-state documents, update
//! policies, and application templates.
//!
//! Every store guards its maps with a `tokio` [`RwLock`]; a write takes the
//! lock for the whole mutation, so readers never observe a partially
//! applied change. Target-state writes additionally use optimistic version
//! CAS with bounded retry, which keeps the single-writer discipline honest
//! even if an admin surface and the rollout monitor race on one device.
//!
//! [`RwLock`]: tokio::sync::RwLock

#![forbid(unsafe_code)]
#![warn(missing_docs)]
// Allow some clippy lints for initial development - will tighten before release
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::significant_drop_tightening)]

pub mod current_state;
pub mod devices;
pub mod error;
pub mod policies;
pub mod target_state;
pub mod templates;

pub use current_state::CurrentStateStore;
pub use devices::{DeviceStore, FleetSummary};
pub use error::{Result, StoreError};
pub use policies::PolicyStore;
pub use target_state::TargetStateService;
pub use templates::TemplateStore;

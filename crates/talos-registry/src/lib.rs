//! # Talos Registry
//!
//! The approved-image registry gate: admission control for rollout
//! creation.
//!
//! Every pushed `(image, tag)` pair is checked against the registry before
//! a rollout may be planned. Unknown tags under approved images are
//! admitted and recorded; unknown images open an approval request and wait;
//! deprecated tags are refused. Images under a configured set of internal
//! namespace prefixes bypass the registry entirely.
//!
//! # Example
//!
//! ```rust
//! use talos_registry::{Admission, GateConfig, RegistryGate};
//!
//! # tokio_test::block_on(async {
//! let gate = RegistryGate::new(GateConfig::default());
//! let admission = gate.admit("docker.io", "redis", "7.2-alpine").await;
//! assert_eq!(admission, Admission::PendingApproval);
//! # });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
// Allow some clippy lints for initial development - will tighten before release
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::significant_drop_tightening)]

pub mod error;
pub mod gate;
pub mod types;

pub use error::{RegistryError, Result};
pub use gate::{Admission, GateConfig, RegistryGate};
pub use types::{ApprovalRequest, ImageEntry, ImageStatus, ImageTag};

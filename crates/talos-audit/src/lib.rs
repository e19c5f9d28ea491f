//! # Talos Audit
//!
//! Append-only domain event publishing for the Talos control plane.
//!
//! Events exist for humans and external consumers: they are subject to
//! filtering and sampling policy and the log is lossy by design. No
//! business invariant may depend on an event having been recorded.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use talos_audit::{DomainEvent, EventPublisher, MemorySink};
//!
//! let sink = Arc::new(MemorySink::new(1024));
//! let publisher = EventPublisher::builder().with_sink(sink.clone()).build();
//!
//! publisher.publish(DomainEvent::device_online("dev-1", 120));
//! assert_eq!(sink.events().len(), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
// Allow some clippy lints for initial development - will tighten before release
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::module_name_repetitions)]

pub mod event;
pub mod publisher;

pub use event::{AggregateType, DomainEvent};
pub use publisher::{
    EventPublisher, EventPublisherBuilder, EventSink, MemorySink, PublishPolicy, SinkError,
    TracingSink,
};

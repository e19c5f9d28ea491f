//! Event publisher implementation.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;

use rand::Rng;
use tracing::{debug, error, info};

use crate::event::DomainEvent;

/// Backend trait for event delivery.
pub trait EventSink: Send + Sync + Debug {
    /// Delivers one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be delivered.
    fn deliver(&self, event: &DomainEvent) -> Result<(), SinkError>;

    /// Returns the sink name for identification.
    fn name(&self) -> &'static str;
}

/// Errors that can occur during event delivery.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Serialization error.
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sink-specific error.
    #[error("sink error: {0}")]
    Backend(String),
}

/// Filtering and sampling policy applied before delivery.
///
/// The event log is lossy by design: a sampled-out or filtered-out event is
/// simply dropped. No state transition may depend on delivery.
#[derive(Debug, Clone)]
pub struct PublishPolicy {
    /// Master switch.
    pub enabled: bool,

    /// Event-type prefixes that are never published.
    pub deny_prefixes: Vec<String>,

    /// Per-event-type sampling rates in `[0, 1]`. Types without an entry
    /// are always published.
    pub sample_rates: HashMap<String, f64>,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            deny_prefixes: Vec::new(),
            sample_rates: HashMap::new(),
        }
    }
}

impl PublishPolicy {
    /// Adds a denied event-type prefix.
    #[must_use]
    pub fn deny_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.deny_prefixes.push(prefix.into());
        self
    }

    /// Sets a sampling rate for an event type.
    #[must_use]
    pub fn sample(mut self, event_type: impl Into<String>, rate: f64) -> Self {
        self.sample_rates
            .insert(event_type.into(), rate.clamp(0.0, 1.0));
        self
    }

    /// Decides whether an event passes the policy.
    fn admits(&self, event: &DomainEvent) -> bool {
        if !self.enabled {
            return false;
        }
        if self
            .deny_prefixes
            .iter()
            .any(|p| event.event_type.starts_with(p.as_str()))
        {
            return false;
        }
        if let Some(rate) = self.sample_rates.get(&event.event_type) {
            return rand::thread_rng().gen_bool(*rate);
        }
        true
    }
}

/// Publishes domain events to configured sinks.
///
/// Publishing never blocks correctness: sink failures are logged and
/// swallowed, and `publish` is infallible from the caller's perspective.
#[derive(Debug)]
pub struct EventPublisher {
    sinks: Vec<Arc<dyn EventSink>>,
    policy: PublishPolicy,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EventPublisher {
    /// Creates a builder for configuring the publisher.
    #[must_use]
    pub fn builder() -> EventPublisherBuilder {
        EventPublisherBuilder::default()
    }

    /// Publishes an event to all sinks, subject to policy.
    pub fn publish(&self, event: DomainEvent) {
        if !self.policy.admits(&event) {
            debug!(event_type = %event.event_type, "event dropped by publish policy");
            return;
        }

        for sink in &self.sinks {
            if let Err(e) = sink.deliver(&event) {
                error!(
                    sink = sink.name(),
                    event_type = %event.event_type,
                    error = %e,
                    "failed to deliver event"
                );
            }
        }
    }

    /// Returns the number of configured sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

/// Builder for configuring an [`EventPublisher`].
#[derive(Debug, Default)]
pub struct EventPublisherBuilder {
    sinks: Vec<Arc<dyn EventSink>>,
    policy: Option<PublishPolicy>,
}

impl EventPublisherBuilder {
    /// Adds a sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Sets the publish policy.
    #[must_use]
    pub fn with_policy(mut self, policy: PublishPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Builds the publisher.
    #[must_use]
    pub fn build(self) -> EventPublisher {
        EventPublisher {
            sinks: self.sinks,
            policy: self.policy.unwrap_or_default(),
        }
    }
}

/// Sink that logs events via tracing.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TracingSink {
    /// Creates a new tracing sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for TracingSink {
    fn deliver(&self, event: &DomainEvent) -> Result<(), SinkError> {
        let json = serde_json::to_string(event)?;
        info!(domain_event = %json, "domain event");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// Bounded in-memory sink; retains the most recent events.
///
/// Backs the admin surface's "recent events for this rollout" view and the
/// test suites.
#[derive(Debug)]
pub struct MemorySink {
    events: Mutex<VecDeque<DomainEvent>>,
    capacity: usize,
}

impl MemorySink {
    /// Creates a sink retaining at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns all retained events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }

    /// Returns retained events for one aggregate, oldest first.
    #[must_use]
    pub fn events_for_aggregate(&self, aggregate_id: &str) -> Vec<DomainEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .cloned()
            .collect()
    }

    /// Returns retained events with the given type, oldest first.
    #[must_use]
    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Clears all retained events.
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSink for MemorySink {
    fn deliver(&self, event: &DomainEvent) -> Result<(), SinkError> {
        let mut events = self.events.lock().unwrap();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

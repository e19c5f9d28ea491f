//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the control-plane process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub listen_addr: SocketAddr,

    /// Rollout monitor tick period.
    pub monitor_tick: Duration,

    /// A device is marked offline when it has not polled for this long.
    pub offline_threshold: Duration,

    /// How often the offline sweep runs.
    pub offline_sweep_interval: Duration,

    /// Image namespace prefixes exempt from registry admission.
    pub internal_image_prefixes: Vec<String>,

    /// How many recent domain events the in-memory sink retains.
    pub event_retention: usize,

    /// Maximum concurrent health checks.
    pub health_concurrency: usize,

    /// Maximum concurrent per-device rollbacks.
    pub rollback_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 3000).into(),
            monitor_tick: Duration::from_secs(30),
            offline_threshold: Duration::from_secs(600),
            offline_sweep_interval: Duration::from_secs(60),
            internal_image_prefixes: Vec::new(),
            event_retention: 4096,
            health_concurrency: 5,
            rollback_concurrency: 10,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration builder.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    listen_addr: Option<SocketAddr>,
    monitor_tick: Option<Duration>,
    offline_threshold: Option<Duration>,
    offline_sweep_interval: Option<Duration>,
    internal_image_prefixes: Vec<String>,
    event_retention: Option<usize>,
    health_concurrency: Option<usize>,
    rollback_concurrency: Option<usize>,
}

impl ServerConfigBuilder {
    /// Sets the listen address.
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Sets the monitor tick period.
    pub fn monitor_tick(mut self, tick: Duration) -> Self {
        self.monitor_tick = Some(tick);
        self
    }

    /// Sets the offline threshold.
    pub fn offline_threshold(mut self, threshold: Duration) -> Self {
        self.offline_threshold = Some(threshold);
        self
    }

    /// Sets the offline sweep interval.
    pub fn offline_sweep_interval(mut self, interval: Duration) -> Self {
        self.offline_sweep_interval = Some(interval);
        self
    }

    /// Adds an internal image namespace prefix.
    pub fn internal_image_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.internal_image_prefixes.push(prefix.into());
        self
    }

    /// Sets the event retention window.
    pub fn event_retention(mut self, capacity: usize) -> Self {
        self.event_retention = Some(capacity);
        self
    }

    /// Sets the health-check concurrency bound.
    pub fn health_concurrency(mut self, concurrency: usize) -> Self {
        self.health_concurrency = Some(concurrency);
        self
    }

    /// Sets the rollback concurrency bound.
    pub fn rollback_concurrency(mut self, concurrency: usize) -> Self {
        self.rollback_concurrency = Some(concurrency);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            listen_addr: self.listen_addr.unwrap_or(defaults.listen_addr),
            monitor_tick: self.monitor_tick.unwrap_or(defaults.monitor_tick),
            offline_threshold: self.offline_threshold.unwrap_or(defaults.offline_threshold),
            offline_sweep_interval: self
                .offline_sweep_interval
                .unwrap_or(defaults.offline_sweep_interval),
            internal_image_prefixes: self.internal_image_prefixes,
            event_retention: self.event_retention.unwrap_or(defaults.event_retention),
            health_concurrency: self
                .health_concurrency
                .unwrap_or(defaults.health_concurrency),
            rollback_concurrency: self
                .rollback_concurrency
                .unwrap_or(defaults.rollback_concurrency),
        }
    }
}

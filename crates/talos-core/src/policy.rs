//! Update policies.
//!
//! A policy decides how a pushed image tag turns into a rollout: which
//! devices it may touch, how the fleet is batched, how health is judged,
//! and how aggressively failures are handled. Policies match pushed images
//! by glob over `image:tag`; when several match, the most specific wins.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::{Error, Result};

/// Rollout strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloutStrategy {
    /// One batch containing all affected devices; starts on the next tick.
    Auto,

    /// N batches advancing automatically with health gating between them.
    Staged,

    /// Staged batching with a deferred start window.
    Scheduled,

    /// Staged batching; every batch start requires an admin command.
    Manual,
}

impl RolloutStrategy {
    /// Returns a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Staged => "staged",
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }

    /// Returns true if the monitor may start this rollout without an
    /// admin command.
    pub fn auto_starts(&self) -> bool {
        matches!(self, Self::Auto | Self::Staged)
    }
}

impl std::fmt::Display for RolloutStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The health check a policy applies after a device converges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheckKind {
    /// HTTP GET against a templated URL. `{device_ip}` and `{device_name}`
    /// are substituted from device metadata.
    Http {
        /// URL template.
        url: String,
        /// Status codes counted as passing.
        #[serde(default = "default_expected_statuses")]
        expected_statuses: Vec<u16>,
    },

    /// TCP connect against a templated host and port.
    Tcp {
        /// Host template. `{device_ip}` is substituted.
        host: String,
        /// Port to connect to.
        port: u16,
    },

    /// Judge health from the device's own current-state report: the named
    /// container must be `running` with the rollout's new tag.
    Container {
        /// Container (service) name to look for.
        container: String,
    },

    /// Health checks disabled; converged devices are immediately healthy.
    Disabled,
}

fn default_expected_statuses() -> Vec<u16> {
    vec![200]
}

/// Health-probe configuration attached to a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProbeConfig {
    /// What kind of check to run.
    #[serde(flatten)]
    pub kind: HealthCheckKind,

    /// Per-check timeout in seconds.
    #[serde(default = "default_probe_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_probe_timeout_seconds() -> u64 {
    30
}

impl HealthProbeConfig {
    /// Disabled probe.
    pub fn disabled() -> Self {
        Self {
            kind: HealthCheckKind::Disabled,
            timeout_seconds: default_probe_timeout_seconds(),
        }
    }

    /// TCP probe against the device IP.
    pub fn tcp(port: u16) -> Self {
        Self {
            kind: HealthCheckKind::Tcp {
                host: "{device_ip}".to_string(),
                port,
            },
            timeout_seconds: default_probe_timeout_seconds(),
        }
    }

    /// HTTP probe with the default expected statuses.
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            kind: HealthCheckKind::Http {
                url: url.into(),
                expected_statuses: default_expected_statuses(),
            },
            timeout_seconds: default_probe_timeout_seconds(),
        }
    }

    /// Container-report probe.
    pub fn container(container: impl Into<String>) -> Self {
        Self {
            kind: HealthCheckKind::Container {
                container: container.into(),
            },
            timeout_seconds: default_probe_timeout_seconds(),
        }
    }

    /// Returns true if checks are disabled.
    pub fn is_disabled(&self) -> bool {
        matches!(self.kind, HealthCheckKind::Disabled)
    }

    /// Per-check timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Restricts which devices a policy may roll out to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    /// Only devices in this fleet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fleet_id: Option<String>,

    /// Only devices carrying all of these tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Explicit allow-list of device uuids (empty = all).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_uuids: Vec<String>,
}

impl DeviceFilter {
    /// Returns true if the device passes every configured restriction.
    pub fn matches(&self, device: &Device) -> bool {
        if let Some(fleet) = &self.fleet_id {
            if device.fleet_id.as_deref() != Some(fleet.as_str()) {
                return false;
            }
        }
        if !self.tags.iter().all(|t| device.tags.contains(t)) {
            return false;
        }
        if !self.device_uuids.is_empty() && !self.device_uuids.contains(&device.uuid) {
            return false;
        }
        true
    }
}

/// Default cumulative stage percentages for staged rollouts.
pub const DEFAULT_STAGE_PERCENTAGES: [u8; 3] = [10, 50, 100];

/// A rollout policy for a family of images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    /// Policy identifier.
    pub id: String,

    /// Glob over `image:tag` deciding which pushes this policy governs.
    pub image_pattern: String,

    /// Rollout strategy.
    pub strategy: RolloutStrategy,

    /// Cumulative stage percentages for staged batching. The last entry is
    /// treated as 100; trailing empty batches are elided at plan time.
    #[serde(default = "default_stage_percentages")]
    pub staged_batches: Vec<u8>,

    /// Dwell time between batch completions, in seconds.
    #[serde(default)]
    pub batch_delay_seconds: u64,

    /// Health probe applied after convergence.
    #[serde(default = "HealthProbeConfig::disabled")]
    pub health_check: HealthProbeConfig,

    /// Automatically roll back devices that fail their health check.
    #[serde(default)]
    pub auto_rollback: bool,

    /// Pause the rollout when the failure rate strictly exceeds this
    /// fraction of devices processed so far.
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,

    /// Disabled policies never match.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Device restrictions.
    #[serde(default)]
    pub filter: DeviceFilter,

    /// How long a scheduled device may take to converge before its row is
    /// failed, in seconds.
    #[serde(default = "default_convergence_timeout_seconds")]
    pub convergence_timeout_seconds: u64,

    /// Start deferral for the `scheduled` strategy, in seconds after plan
    /// time. Ignored by other strategies.
    #[serde(default)]
    pub start_delay_seconds: u64,
}

fn default_stage_percentages() -> Vec<u8> {
    DEFAULT_STAGE_PERCENTAGES.to_vec()
}

fn default_max_failure_rate() -> f64 {
    0.25
}

fn default_true() -> bool {
    true
}

fn default_convergence_timeout_seconds() -> u64 {
    15 * 60
}

impl UpdatePolicy {
    /// Creates a policy with defaults for everything but the pattern and
    /// strategy.
    pub fn new(
        id: impl Into<String>,
        image_pattern: impl Into<String>,
        strategy: RolloutStrategy,
    ) -> Self {
        Self {
            id: id.into(),
            image_pattern: image_pattern.into(),
            strategy,
            staged_batches: default_stage_percentages(),
            batch_delay_seconds: 0,
            health_check: HealthProbeConfig::disabled(),
            auto_rollback: false,
            max_failure_rate: default_max_failure_rate(),
            enabled: true,
            filter: DeviceFilter::default(),
            convergence_timeout_seconds: default_convergence_timeout_seconds(),
            start_delay_seconds: 0,
        }
    }

    /// Sets the health probe.
    pub fn with_health_check(mut self, probe: HealthProbeConfig) -> Self {
        self.health_check = probe;
        self
    }

    /// Enables or disables auto-rollback.
    pub fn with_auto_rollback(mut self, enabled: bool) -> Self {
        self.auto_rollback = enabled;
        self
    }

    /// Sets the maximum tolerated failure rate.
    pub fn with_max_failure_rate(mut self, rate: f64) -> Self {
        self.max_failure_rate = rate;
        self
    }

    /// Sets the cumulative stage percentages.
    pub fn with_staged_batches(mut self, percentages: Vec<u8>) -> Self {
        self.staged_batches = percentages;
        self
    }

    /// Sets the dwell time between batches.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay_seconds = delay.as_secs();
        self
    }

    /// Sets the device filter.
    pub fn with_filter(mut self, filter: DeviceFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Validates the policy: the glob must compile and rates/stages must be
    /// in range.
    pub fn validate(&self) -> Result<()> {
        glob::Pattern::new(&self.image_pattern).map_err(|e| Error::InvalidImagePattern {
            pattern: self.image_pattern.clone(),
            reason: e.to_string(),
        })?;
        if !(0.0..=1.0).contains(&self.max_failure_rate) {
            return Err(Error::InvalidPolicy {
                id: self.id.clone(),
                reason: format!(
                    "max_failure_rate {} outside [0, 1]",
                    self.max_failure_rate
                ),
            });
        }
        if self.staged_batches.is_empty() {
            return Err(Error::InvalidPolicy {
                id: self.id.clone(),
                reason: "staged_batches must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Returns true if this enabled policy matches `image:tag`.
    pub fn matches(&self, image: &str, tag: &str) -> bool {
        if !self.enabled {
            return false;
        }
        glob::Pattern::new(&self.image_pattern)
            .map(|p| p.matches(&format!("{image}:{tag}")))
            .unwrap_or(false)
    }

    /// Specificity of the pattern: the length of its literal prefix.
    ///
    /// `redis:7.*` (8) beats `redis:*` (6) beats `*` (0).
    pub fn specificity(&self) -> usize {
        self.image_pattern
            .find(['*', '?', '['])
            .unwrap_or(self.image_pattern.len())
    }

    /// Dwell time between batches.
    pub fn batch_delay(&self) -> Duration {
        Duration::from_secs(self.batch_delay_seconds)
    }

    /// Convergence deadline for scheduled rows.
    pub fn convergence_timeout(&self) -> Duration {
        Duration::from_secs(self.convergence_timeout_seconds)
    }
}

/// Selects the most specific enabled policy matching `image:tag`.
///
/// Ties are broken in favor of the earliest policy.
pub fn select_policy<'a, I>(policies: I, image: &str, tag: &str) -> Option<&'a UpdatePolicy>
where
    I: IntoIterator<Item = &'a UpdatePolicy>,
{
    policies
        .into_iter()
        .filter(|p| p.matches(image, tag))
        .min_by_key(|p| std::cmp::Reverse(p.specificity()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_display() {
        assert_eq!(RolloutStrategy::Auto.to_string(), "auto");
        assert_eq!(RolloutStrategy::Staged.to_string(), "staged");
        assert_eq!(RolloutStrategy::Scheduled.as_str(), "scheduled");
        assert_eq!(RolloutStrategy::Manual.as_str(), "manual");
    }

    #[test]
    fn test_strategy_auto_starts() {
        assert!(RolloutStrategy::Auto.auto_starts());
        assert!(RolloutStrategy::Staged.auto_starts());
        assert!(!RolloutStrategy::Scheduled.auto_starts());
        assert!(!RolloutStrategy::Manual.auto_starts());
    }

    #[test]
    fn test_policy_matches_glob() {
        let policy = UpdatePolicy::new("p1", "redis:*", RolloutStrategy::Staged);
        assert!(policy.matches("redis", "7.2-alpine"));
        assert!(!policy.matches("postgres", "16"));
    }

    #[test]
    fn test_disabled_policy_never_matches() {
        let mut policy = UpdatePolicy::new("p1", "redis:*", RolloutStrategy::Auto);
        policy.enabled = false;
        assert!(!policy.matches("redis", "7.2-alpine"));
    }

    #[test]
    fn test_specificity() {
        assert_eq!(
            UpdatePolicy::new("p", "redis:7.*", RolloutStrategy::Auto).specificity(),
            8
        );
        assert_eq!(
            UpdatePolicy::new("p", "redis:*", RolloutStrategy::Auto).specificity(),
            6
        );
        assert_eq!(
            UpdatePolicy::new("p", "*", RolloutStrategy::Auto).specificity(),
            0
        );
        assert_eq!(
            UpdatePolicy::new("p", "redis:7-alpine", RolloutStrategy::Auto).specificity(),
            14
        );
    }

    #[test]
    fn test_select_policy_most_specific_wins() {
        let broad = UpdatePolicy::new("broad", "*", RolloutStrategy::Auto);
        let narrow = UpdatePolicy::new("narrow", "redis:*", RolloutStrategy::Staged);
        let policies = vec![broad, narrow];

        let selected = select_policy(&policies, "redis", "7.2-alpine").unwrap();
        assert_eq!(selected.id, "narrow");

        // Only the broad one matches other images.
        let selected = select_policy(&policies, "nginx", "1.25").unwrap();
        assert_eq!(selected.id, "broad");
    }

    #[test]
    fn test_select_policy_none_matches() {
        let policy = UpdatePolicy::new("p", "redis:*", RolloutStrategy::Auto);
        assert!(select_policy(std::iter::once(&policy), "nginx", "1.25").is_none());
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let policy = UpdatePolicy::new("p", "redis:[", RolloutStrategy::Auto);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_failure_rate() {
        let policy =
            UpdatePolicy::new("p", "redis:*", RolloutStrategy::Auto).with_max_failure_rate(1.5);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let policy = UpdatePolicy::new("p", "redis:*", RolloutStrategy::Staged);
        assert!(policy.validate().is_ok());
        assert_eq!(policy.staged_batches, vec![10, 50, 100]);
        assert_eq!(policy.convergence_timeout(), Duration::from_secs(900));
    }

    #[test]
    fn test_device_filter_fleet_and_tags() {
        let device = Device::new("dev-1", "sensor")
            .with_fleet("fleet-eu")
            .with_tag("canary");

        let mut filter = DeviceFilter {
            fleet_id: Some("fleet-eu".to_string()),
            tags: vec!["canary".to_string()],
            device_uuids: Vec::new(),
        };
        assert!(filter.matches(&device));

        filter.fleet_id = Some("fleet-us".to_string());
        assert!(!filter.matches(&device));
    }

    #[test]
    fn test_device_filter_uuid_allow_list() {
        let device = Device::new("dev-1", "sensor");
        let filter = DeviceFilter {
            device_uuids: vec!["dev-2".to_string()],
            ..DeviceFilter::default()
        };
        assert!(!filter.matches(&device));

        let filter = DeviceFilter {
            device_uuids: vec!["dev-1".to_string(), "dev-2".to_string()],
            ..DeviceFilter::default()
        };
        assert!(filter.matches(&device));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let device = Device::new("dev-1", "sensor");
        assert!(DeviceFilter::default().matches(&device));
    }

    #[test]
    fn test_health_probe_constructors() {
        assert!(HealthProbeConfig::disabled().is_disabled());

        let tcp = HealthProbeConfig::tcp(6379);
        assert!(matches!(
            tcp.kind,
            HealthCheckKind::Tcp { port: 6379, .. }
        ));
        assert_eq!(tcp.timeout(), Duration::from_secs(30));

        let http = HealthProbeConfig::http("http://{device_ip}/healthz");
        if let HealthCheckKind::Http {
            expected_statuses, ..
        } = &http.kind
        {
            assert_eq!(expected_statuses, &vec![200]);
        } else {
            panic!("expected http probe");
        }
    }

    #[test]
    fn test_policy_serde_round_trip() {
        let policy = UpdatePolicy::new("p1", "redis:*", RolloutStrategy::Staged)
            .with_health_check(HealthProbeConfig::tcp(6379))
            .with_auto_rollback(true)
            .with_max_failure_rate(0.2);

        let json = serde_json::to_string(&policy).unwrap();
        let back: UpdatePolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
        assert!(json.contains("\"strategy\":\"staged\""));
    }
}

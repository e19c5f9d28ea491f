//! Post-update per-device health evaluation.
//!
//! The evaluator runs the policy's probe against devices whose rows reached
//! `updated`. Checks run at most K at a time, each bounded by its own
//! timeout; a timed-out check counts as failed.

use std::time::Duration;

use futures::future::join_all;
use talos_core::{CurrentStateDocument, Device, DeviceUuid, HealthCheckKind, HealthProbeConfig};
use tokio::net::TcpStream;
use tracing::debug;

/// Result surface of one health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Check passed.
    Passed,

    /// Check failed, with a reason.
    Failed(String),

    /// Check exceeded its deadline. Counts as failed.
    TimedOut,

    /// Checks are disabled by policy.
    Skipped,
}

impl ProbeOutcome {
    /// Returns true for a passing check.
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Passed)
    }

    /// Returns true when checks are disabled.
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    /// Human-readable detail for events and row errors.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Failed(reason) => Some(reason.clone()),
            Self::TimedOut => Some("health check timed out".to_string()),
            Self::Passed | Self::Skipped => None,
        }
    }
}

/// One device to check, with its last reported state.
#[derive(Debug, Clone)]
pub struct HealthTarget {
    /// The device under check.
    pub device: Device,

    /// Its stored current-state document, if it has ever reported.
    pub current_state: Option<CurrentStateDocument>,
}

/// Configuration for the health evaluator.
#[derive(Debug, Clone)]
pub struct HealthEvaluatorConfig {
    /// Maximum checks in flight at once.
    pub concurrency: usize,
}

impl Default for HealthEvaluatorConfig {
    fn default() -> Self {
        Self { concurrency: 5 }
    }
}

/// Runs health probes with bounded concurrency.
#[derive(Debug)]
pub struct HealthEvaluator {
    config: HealthEvaluatorConfig,
    http: reqwest::Client,
}

impl Default for HealthEvaluator {
    fn default() -> Self {
        Self::new(HealthEvaluatorConfig::default())
    }
}

impl HealthEvaluator {
    /// Creates a new evaluator.
    #[must_use]
    pub fn new(config: HealthEvaluatorConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Checks the given targets, at most `concurrency` in parallel.
    ///
    /// Targets beyond the concurrency bound wait in FIFO order. Returns one
    /// outcome per target, in input order.
    pub async fn evaluate(
        &self,
        probe: &HealthProbeConfig,
        image_name: &str,
        new_tag: &str,
        targets: &[HealthTarget],
    ) -> Vec<(DeviceUuid, ProbeOutcome)> {
        let mut results = Vec::with_capacity(targets.len());
        for chunk in targets.chunks(self.config.concurrency.max(1)) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|target| self.check_one(probe, image_name, new_tag, target))
                .collect();
            let outcomes = join_all(futures).await;
            for (target, outcome) in chunk.iter().zip(outcomes) {
                debug!(
                    device_uuid = %target.device.uuid,
                    outcome = ?outcome,
                    "health check concluded"
                );
                results.push((target.device.uuid.clone(), outcome));
            }
        }
        results
    }

    /// Runs one probe against one device.
    pub async fn check_one(
        &self,
        probe: &HealthProbeConfig,
        image_name: &str,
        new_tag: &str,
        target: &HealthTarget,
    ) -> ProbeOutcome {
        match &probe.kind {
            HealthCheckKind::Disabled => ProbeOutcome::Skipped,
            HealthCheckKind::Http {
                url,
                expected_statuses,
            } => {
                let url = match substitute(url, target) {
                    Ok(u) => u,
                    Err(reason) => return ProbeOutcome::Failed(reason),
                };
                self.check_http(&url, expected_statuses, probe.timeout()).await
            }
            HealthCheckKind::Tcp { host, port } => {
                let host = match substitute(host, target) {
                    Ok(h) => h,
                    Err(reason) => return ProbeOutcome::Failed(reason),
                };
                Self::check_tcp(&host, *port, probe.timeout()).await
            }
            HealthCheckKind::Container { container } => {
                Self::check_container(container, image_name, new_tag, target)
            }
        }
    }

    async fn check_http(
        &self,
        url: &str,
        expected_statuses: &[u16],
        timeout: Duration,
    ) -> ProbeOutcome {
        let request = self.http.get(url).timeout(timeout).send();
        match tokio::time::timeout(timeout, request).await {
            Err(_) => ProbeOutcome::TimedOut,
            Ok(Err(e)) if e.is_timeout() => ProbeOutcome::TimedOut,
            Ok(Err(e)) => ProbeOutcome::Failed(format!("request failed: {e}")),
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                if expected_statuses.contains(&status) {
                    ProbeOutcome::Passed
                } else {
                    ProbeOutcome::Failed(format!("unexpected status {status}"))
                }
            }
        }
    }

    async fn check_tcp(host: &str, port: u16, timeout: Duration) -> ProbeOutcome {
        let addr = format!("{host}:{port}");
        match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Err(_) => ProbeOutcome::TimedOut,
            Ok(Err(e)) => ProbeOutcome::Failed(format!("connect to {addr} failed: {e}")),
            Ok(Ok(_)) => ProbeOutcome::Passed,
        }
    }

    fn check_container(
        container: &str,
        image_name: &str,
        new_tag: &str,
        target: &HealthTarget,
    ) -> ProbeOutcome {
        let Some(state) = &target.current_state else {
            return ProbeOutcome::Failed("device has never reported".to_string());
        };
        if state.container_running_with_tag(container, image_name, new_tag) {
            ProbeOutcome::Passed
        } else if state.service_report(container).is_none() {
            ProbeOutcome::Failed(format!("container '{container}' not reported"))
        } else {
            ProbeOutcome::Failed(format!(
                "container '{container}' not running {image_name}:{new_tag}"
            ))
        }
    }
}

/// Substitutes `{device_ip}` and `{device_name}` placeholders.
fn substitute(template: &str, target: &HealthTarget) -> Result<String, String> {
    let mut out = template.to_string();
    if out.contains("{device_ip}") {
        let ip = target
            .current_state
            .as_ref()
            .and_then(|s| s.system_info.ip.clone())
            .ok_or_else(|| "device has not reported an IP address".to_string())?;
        out = out.replace("{device_ip}", &ip);
    }
    if out.contains("{device_name}") {
        out = out.replace("{device_name}", &target.device.name);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use talos_core::{AppReport, ContainerStatus, ServiceReport, SystemInfo};
    use tokio::io::AsyncWriteExt;

    fn target_with_state(ip: Option<&str>, tag: Option<&str>) -> HealthTarget {
        let mut state = CurrentStateDocument::default();
        state.system_info = SystemInfo {
            ip: ip.map(ToString::to_string),
            ..SystemInfo::default()
        };
        if let Some(tag) = tag {
            let mut apps = BTreeMap::new();
            apps.insert(
                1002,
                AppReport {
                    services: vec![ServiceReport {
                        id: 1,
                        name: "redis".to_string(),
                        status: ContainerStatus::Running,
                        image: Some(format!("redis:{tag}")),
                    }],
                },
            );
            state.apps = apps;
        }
        HealthTarget {
            device: Device::new("dev-1", "lobby-sensor"),
            current_state: Some(state),
        }
    }

    #[tokio::test]
    async fn test_disabled_probe_is_skipped() {
        let evaluator = HealthEvaluator::default();
        let outcome = evaluator
            .check_one(
                &HealthProbeConfig::disabled(),
                "redis",
                "7.2",
                &target_with_state(None, None),
            )
            .await;
        assert_eq!(outcome, ProbeOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_container_probe_passes_on_running_new_tag() {
        let evaluator = HealthEvaluator::default();
        let outcome = evaluator
            .check_one(
                &HealthProbeConfig::container("redis"),
                "redis",
                "7.2-alpine",
                &target_with_state(None, Some("7.2-alpine")),
            )
            .await;
        assert_eq!(outcome, ProbeOutcome::Passed);
    }

    #[tokio::test]
    async fn test_container_probe_fails_on_old_tag() {
        let evaluator = HealthEvaluator::default();
        let outcome = evaluator
            .check_one(
                &HealthProbeConfig::container("redis"),
                "redis",
                "7.2-alpine",
                &target_with_state(None, Some("7-alpine")),
            )
            .await;
        assert!(matches!(outcome, ProbeOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_container_probe_fails_without_report() {
        let evaluator = HealthEvaluator::default();
        let target = HealthTarget {
            device: Device::new("dev-1", "sensor"),
            current_state: None,
        };
        let outcome = evaluator
            .check_one(&HealthProbeConfig::container("redis"), "redis", "7.2", &target)
            .await;
        assert!(matches!(outcome, ProbeOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_tcp_probe_passes_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let evaluator = HealthEvaluator::default();
        let outcome = evaluator
            .check_one(
                &HealthProbeConfig::tcp(port),
                "redis",
                "7.2",
                &target_with_state(Some("127.0.0.1"), None),
            )
            .await;
        assert_eq!(outcome, ProbeOutcome::Passed);
    }

    #[tokio::test]
    async fn test_tcp_probe_fails_without_ip() {
        let evaluator = HealthEvaluator::default();
        let outcome = evaluator
            .check_one(
                &HealthProbeConfig::tcp(6379),
                "redis",
                "7.2",
                &target_with_state(None, None),
            )
            .await;
        assert!(matches!(outcome, ProbeOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_tcp_probe_times_out() {
        // 10.255.255.1 is unroutable; the connect pends until the deadline.
        let probe = HealthProbeConfig {
            timeout_seconds: 0,
            ..HealthProbeConfig::tcp(6379)
        };

        let evaluator = HealthEvaluator::default();
        let outcome = evaluator
            .check_one(
                &probe,
                "redis",
                "7.2",
                &target_with_state(Some("10.255.255.1"), None),
            )
            .await;
        assert!(matches!(
            outcome,
            ProbeOutcome::TimedOut | ProbeOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_http_probe_against_local_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                });
            }
        });

        let evaluator = HealthEvaluator::default();
        let outcome = evaluator
            .check_one(
                &HealthProbeConfig::http(format!("http://{{device_ip}}:{port}/healthz")),
                "redis",
                "7.2",
                &target_with_state(Some("127.0.0.1"), None),
            )
            .await;
        assert_eq!(outcome, ProbeOutcome::Passed);
    }

    #[tokio::test]
    async fn test_evaluate_preserves_input_order() {
        let evaluator = HealthEvaluator::new(HealthEvaluatorConfig { concurrency: 2 });
        let targets: Vec<HealthTarget> = (0..5)
            .map(|i| HealthTarget {
                device: Device::new(format!("dev-{i}"), "sensor"),
                current_state: None,
            })
            .collect();

        let outcomes = evaluator
            .evaluate(&HealthProbeConfig::disabled(), "redis", "7.2", &targets)
            .await;
        let uuids: Vec<&str> = outcomes.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(uuids, vec!["dev-0", "dev-1", "dev-2", "dev-3", "dev-4"]);
        assert!(outcomes.iter().all(|(_, o)| o.is_skipped()));
    }

    #[test]
    fn test_substitute_placeholders() {
        let target = target_with_state(Some("192.168.1.10"), None);
        let url = substitute("http://{device_ip}/h?name={device_name}", &target).unwrap();
        assert_eq!(url, "http://192.168.1.10/h?name=lobby-sensor");

        let no_ip = target_with_state(None, None);
        assert!(substitute("http://{device_ip}/h", &no_ip).is_err());
    }

    #[test]
    fn test_probe_outcome_detail() {
        assert!(ProbeOutcome::Passed.detail().is_none());
        assert_eq!(
            ProbeOutcome::TimedOut.detail().unwrap(),
            "health check timed out"
        );
        assert_eq!(
            ProbeOutcome::Failed("boom".to_string()).detail().unwrap(),
            "boom"
        );
    }
}

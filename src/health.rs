//! Periodic deployment health prober.
//!
//! Every sweep launches one probe per deployment in parallel, each with its
//! own timeout, and publishes the results to the deployment registry under
//! the write lock. Baseline-tagged deployments skip the probe and are marked
//! healthy unconditionally — that is what makes them the fallback of last
//! resort. `healthy` strictly means "the last probe succeeded"; `available`
//! additionally requires fewer than three consecutive failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::providers::ProviderClient;
use crate::registry::{DeploymentRegistry, ProviderKind, MAX_CONSECUTIVE_FAILS};

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HealthChecker {
    deployments: Arc<DeploymentRegistry>,
    providers: HashMap<ProviderKind, Arc<ProviderClient>>,
    interval: Duration,
    probe_timeout: Duration,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl HealthChecker {
    pub fn new(
        deployments: Arc<DeploymentRegistry>,
        providers: HashMap<ProviderKind, Arc<ProviderClient>>,
    ) -> Self {
        Self {
            deployments,
            providers,
            interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            shutdown: None,
            handle: None,
        }
    }

    /// Override the probe cadence; used by tests and dev setups.
    pub fn with_timing(mut self, interval: Duration, probe_timeout: Duration) -> Self {
        self.interval = interval;
        self.probe_timeout = probe_timeout;
        self
    }

    /// Spawn the sweep loop. Idempotent — a running checker is left alone.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        self.shutdown = Some(tx);

        let deployments = Arc::clone(&self.deployments);
        let providers = self.providers.clone();
        let interval = self.interval;
        let probe_timeout = self.probe_timeout;

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep(&deployments, &providers, probe_timeout).await;
                    }
                    _ = rx.changed() => {
                        debug!("health checker stopping");
                        break;
                    }
                }
            }
        }));
        info!(interval_secs = interval.as_secs_f64(), "health checker started");
    }

    /// Signal the sweep loop to exit. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        self.handle = None;
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One probe pass over every registered deployment, all in parallel.
async fn sweep(
    deployments: &Arc<DeploymentRegistry>,
    providers: &HashMap<ProviderKind, Arc<ProviderClient>>,
    probe_timeout: Duration,
) {
    let snapshot = deployments.list();
    let probes = snapshot.into_iter().map(|deployment| {
        let deployments = Arc::clone(deployments);
        let provider = providers.get(&deployment.provider).cloned();
        async move {
            if deployment.is_baseline() {
                // Never probed; availability is hard-coded true.
                deployments.update(&deployment.id, |d| {
                    d.status.healthy = true;
                    d.status.available = true;
                    d.status.consecutive_fails = 0;
                    d.status.last_check = Some(Utc::now());
                });
                return;
            }
            let Some(provider) = provider else {
                warn!(deployment = %deployment.id, "no provider for health probe");
                return;
            };

            let t0 = Instant::now();
            let outcome =
                tokio::time::timeout(probe_timeout, provider.health_check(&deployment)).await;
            let latency_ms = t0.elapsed().as_millis() as u64;

            match outcome {
                Ok(Ok(())) => {
                    deployments.update(&deployment.id, |d| {
                        let now = Utc::now();
                        d.status.healthy = true;
                        d.status.available = true;
                        d.status.consecutive_fails = 0;
                        d.status.last_check = Some(now);
                        d.status.last_success = Some(now);
                        d.status.last_error = None;
                        d.status.latency_ms = latency_ms;
                        d.metrics.observe_latency(latency_ms);
                    });
                }
                probe_failure => {
                    let error = match probe_failure {
                        Ok(Err(e)) => e.to_string(),
                        _ => format!("probe timed out after {probe_timeout:?}"),
                    };
                    warn!(deployment = %deployment.id, %error, "health probe failed");
                    deployments.update(&deployment.id, |d| {
                        d.status.healthy = false;
                        d.status.consecutive_fails += 1;
                        d.status.last_check = Some(Utc::now());
                        d.status.last_error = Some(error);
                        if d.status.consecutive_fails >= MAX_CONSECUTIVE_FAILS {
                            d.status.available = false;
                        }
                    });
                }
            }
        }
    });
    join_all(probes).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayCredentials;
    use crate::providers::GatewayProvider;
    use crate::registry::tests::test_deployment;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn providers() -> HashMap<ProviderKind, Arc<ProviderClient>> {
        let mut map = HashMap::new();
        map.insert(
            ProviderKind::Gateway,
            Arc::new(ProviderClient::Gateway(GatewayProvider::new(
                GatewayCredentials::default(),
            ))),
        );
        map
    }

    fn ok_body() -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"content": "pong"}, "finish_reason": "stop"}]
        })
    }

    #[tokio::test]
    async fn successful_probe_updates_status_and_latency() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&server)
            .await;

        let registry = Arc::new(DeploymentRegistry::new());
        let mut dep = test_deployment("d1", "m");
        dep.endpoint.base_url = server.uri();
        dep.status.healthy = false;
        dep.status.consecutive_fails = 2;
        registry.register(dep);

        sweep(&registry, &providers(), Duration::from_secs(5)).await;

        let d = registry.get("d1").unwrap();
        assert!(d.status.healthy);
        assert!(d.status.available);
        assert_eq!(d.status.consecutive_fails, 0);
        assert!(d.status.last_success.is_some());
        assert!(d.metrics.latency_ema_ms > 0.0, "EMA seeded from the first probe");
    }

    #[tokio::test]
    async fn third_failed_probe_clears_availability() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let registry = Arc::new(DeploymentRegistry::new());
        let mut dep = test_deployment("d1", "m");
        dep.endpoint.base_url = server.uri();
        registry.register(dep);

        let providers = providers();
        for expected_fails in 1..=3u32 {
            sweep(&registry, &providers, Duration::from_secs(5)).await;
            let d = registry.get("d1").unwrap();
            assert!(!d.status.healthy);
            assert_eq!(d.status.consecutive_fails, expected_fails);
            assert_eq!(d.status.available, expected_fails < 3);
        }
        let d = registry.get("d1").unwrap();
        assert!(d.status.last_error.is_some());
    }

    #[tokio::test]
    async fn baseline_is_marked_healthy_without_probing() {
        // No provider registered at all — a probe attempt would fail loudly.
        let registry = Arc::new(DeploymentRegistry::new());
        let mut dep = test_deployment("baseline", "m");
        dep.provider = ProviderKind::Direct;
        dep.tags.insert("mode".into(), "baseline".into());
        dep.status.healthy = false;
        registry.register(dep);

        sweep(&registry, &HashMap::new(), Duration::from_secs(5)).await;

        let d = registry.get("baseline").unwrap();
        assert!(d.status.healthy);
        assert!(d.status.available);
        assert!(d.status.last_check.is_some());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let registry = Arc::new(DeploymentRegistry::new());
        let mut checker = HealthChecker::new(registry, HashMap::new())
            .with_timing(Duration::from_millis(10), Duration::from_millis(50));

        checker.start();
        checker.start(); // no-op
        tokio::time::sleep(Duration::from_millis(30)).await;
        checker.stop();
        checker.stop(); // no-op

        checker.start(); // restart after stop is allowed
        checker.stop();
    }

    #[tokio::test]
    async fn sweep_loop_probes_on_the_configured_interval() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&server)
            .await;

        let registry = Arc::new(DeploymentRegistry::new());
        let mut dep = test_deployment("d1", "m");
        dep.endpoint.base_url = server.uri();
        dep.status.healthy = false;
        registry.register(dep);

        let mut checker = HealthChecker::new(Arc::clone(&registry), providers())
            .with_timing(Duration::from_millis(20), Duration::from_secs(2));
        checker.start();

        // Give the loop a couple of ticks.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if registry.get("d1").unwrap().status.healthy {
                break;
            }
        }
        checker.stop();
        assert!(registry.get("d1").unwrap().status.healthy);
    }
}

//! Request routing — the brain of omnigate.
//!
//! [`Router::route`] turns a requested model id into a [`RoutingDecision`]:
//! one healthy primary deployment plus an ordered fallback list, chosen by the
//! configured [`Strategy`] over the candidates that pass the availability
//! filter and their circuit breakers. [`Router::execute`] then walks the
//! decision in order, recording success/failure on both the registry counters
//! and the breakers, until a deployment answers or the list is exhausted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::error::GatewayError;
use crate::providers::{ProviderClient, StreamStats};
use crate::registry::{Deployment, DeploymentRegistry, ModelRegistry, ProviderKind};
use crate::types::{ChatRequest, ChatResponse, StreamSink, Usage};

/// Maximum number of fallback deployments carried in a decision.
const MAX_FALLBACKS: usize = 3;

/// How the primary deployment is picked from the candidate set.
///
/// All strategies operate on the filtered candidates with ties broken by
/// deployment id lexicographically, so selection is deterministic given equal
/// inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Ascending by the priority field; lower wins.
    Priority,
    /// Sample proportionally to weight. Zero total weight picks the first.
    #[default]
    Weighted,
    /// Per-model counter over the candidate list; wraps at overflow.
    RoundRobin,
    /// Ascending by latency EMA; unpolled deployments are treated as best.
    LeastLatency,
    /// Reserved for a future cost computation; currently deterministic first.
    LeastCost,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Priority => "priority",
            Self::Weighted => "weighted",
            Self::RoundRobin => "round-robin",
            Self::LeastLatency => "least-latency",
            Self::LeastCost => "least-cost",
        })
    }
}

/// The per-request selection produced by [`Router::route`].
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub request_id: String,
    /// Resolved logical model id (post reverse-lookup).
    pub model_id: String,
    pub primary: String,
    /// Ordered, at most [`MAX_FALLBACKS`] entries.
    pub fallbacks: Vec<String>,
    pub strategy: Strategy,
    pub created_at: DateTime<Utc>,
}

impl RoutingDecision {
    /// Primary first, then the fallbacks in order.
    pub fn attempt_order(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }
}

pub struct Router {
    models: Arc<ModelRegistry>,
    deployments: Arc<DeploymentRegistry>,
    providers: HashMap<ProviderKind, Arc<ProviderClient>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    strategy: Strategy,
    /// Round-robin position per model id; advances monotonically.
    rr_counters: Mutex<HashMap<String, u64>>,
}

impl Router {
    pub fn new(
        models: Arc<ModelRegistry>,
        deployments: Arc<DeploymentRegistry>,
        providers: HashMap<ProviderKind, Arc<ProviderClient>>,
        strategy: Strategy,
    ) -> Self {
        Self {
            models,
            deployments,
            providers,
            breakers: DashMap::new(),
            strategy,
            rr_counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// The breaker guarding a deployment, created on first sight.
    pub fn breaker_for(&self, deployment: &Deployment) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(deployment.id.clone())
            .or_insert_with(|| {
                Arc::new(if deployment.is_baseline() {
                    CircuitBreaker::exempt()
                } else {
                    CircuitBreaker::default()
                })
            })
            .clone()
    }

    /// Select a primary and fallbacks for `model_id`.
    ///
    /// Unknown model ids get one more chance via reverse lookup: a deployment
    /// whose provider-side model id matches resolves to its owning model. The
    /// requested id is never silently substituted beyond that.
    #[tracing::instrument(skip(self), fields(strategy = %self.strategy))]
    pub fn route(&self, model_id: &str, request_id: &str) -> Result<RoutingDecision, GatewayError> {
        let model = self
            .models
            .get(model_id)
            .or_else(|| {
                self.deployments
                    .find_by_provider_model(model_id)
                    .and_then(|d| self.models.get(&d.model_id))
            })
            .ok_or_else(|| GatewayError::ModelNotFound(model_id.to_string()))?;

        let candidates: Vec<Deployment> = self
            .deployments
            .healthy_for_model(&model.id)
            .into_iter()
            .filter(|d| self.breaker_for(d).allow())
            .collect();
        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyDeployment(model.id));
        }

        let ordered = self.ordered(&model.id, candidates);
        let mut ids = ordered.into_iter().map(|d| d.id);
        let primary = ids.next().expect("ordered candidates are non-empty");
        let fallbacks: Vec<String> = ids.take(MAX_FALLBACKS).collect();

        debug!(model = %model.id, %primary, fallbacks = ?fallbacks, "routed");

        Ok(RoutingDecision {
            request_id: request_id.to_string(),
            model_id: model.id,
            primary,
            fallbacks,
            strategy: self.strategy,
            created_at: Utc::now(),
        })
    }

    /// Order candidates per the active strategy. Input arrives sorted by id.
    fn ordered(&self, model_id: &str, mut candidates: Vec<Deployment>) -> Vec<Deployment> {
        match self.strategy {
            Strategy::Priority => {
                candidates
                    .sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
            }
            Strategy::Weighted => {
                let total: u64 = candidates.iter().map(|d| u64::from(d.weight)).sum();
                let pick = if total == 0 {
                    0
                } else {
                    let mut roll = rand::thread_rng().gen_range(0..total);
                    candidates
                        .iter()
                        .position(|d| {
                            if roll < u64::from(d.weight) {
                                true
                            } else {
                                roll -= u64::from(d.weight);
                                false
                            }
                        })
                        .unwrap_or(0)
                };
                let primary = candidates.remove(pick);
                candidates
                    .sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.id.cmp(&b.id)));
                candidates.insert(0, primary);
            }
            Strategy::RoundRobin => {
                let mut counters = self.rr_counters.lock().expect("rr counter lock poisoned");
                let counter = counters.entry(model_id.to_string()).or_insert(0);
                let offset = (*counter % candidates.len() as u64) as usize;
                *counter = counter.wrapping_add(1);
                candidates.rotate_left(offset);
            }
            Strategy::LeastLatency => {
                candidates.sort_by(|a, b| {
                    a.metrics
                        .latency_ema_ms
                        .partial_cmp(&b.metrics.latency_ema_ms)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.id.cmp(&b.id))
                });
            }
            Strategy::LeastCost => {}
        }
        candidates
    }

    /// Execute a buffered request against the decision, failing over in order.
    pub async fn execute(
        &self,
        request: &ChatRequest,
        decision: &RoutingDecision,
    ) -> Result<ChatResponse, GatewayError> {
        let mut last_err: Option<GatewayError> = None;
        for dep_id in decision.attempt_order() {
            let Some(deployment) = self.deployments.get(dep_id) else {
                continue;
            };
            let Some(provider) = self.providers.get(&deployment.provider) else {
                warn!(deployment = %dep_id, provider = %deployment.provider, "no provider registered");
                last_err = Some(GatewayError::Internal(format!(
                    "provider {} not registered",
                    deployment.provider
                )));
                continue;
            };

            let t0 = Instant::now();
            match provider.execute(request, &deployment).await {
                Ok(response) => {
                    self.record_success(dep_id, t0.elapsed().as_millis() as u64, response.usage);
                    return Ok(response);
                }
                Err(e) => {
                    warn!(deployment = %dep_id, error = %e, "deployment failed — trying next");
                    self.record_failure(dep_id, &e.to_string());
                    last_err = Some(e);
                }
            }
        }
        Err(GatewayError::Exhausted {
            model: decision.model_id.clone(),
            last: Box::new(last_err.unwrap_or_else(|| {
                GatewayError::Internal("decision contained no executable deployment".into())
            })),
        })
    }

    /// Streaming variant. Failover applies only until the stream starts; a
    /// break after first byte is reported through [`StreamStats::mid_error`]
    /// and recorded as a deployment failure, but not retried — the caller has
    /// already seen partial output.
    pub async fn execute_stream(
        &self,
        request: &ChatRequest,
        decision: &RoutingDecision,
        sink: &StreamSink,
    ) -> Result<StreamStats, GatewayError> {
        let mut last_err: Option<GatewayError> = None;
        for dep_id in decision.attempt_order() {
            let Some(deployment) = self.deployments.get(dep_id) else {
                continue;
            };
            let Some(provider) = self.providers.get(&deployment.provider) else {
                last_err = Some(GatewayError::Internal(format!(
                    "provider {} not registered",
                    deployment.provider
                )));
                continue;
            };

            let t0 = Instant::now();
            match provider.stream(request, &deployment, sink).await {
                Ok(stats) => {
                    match &stats.mid_error {
                        Some(mid) => self.record_failure(dep_id, mid),
                        None => self.record_success(
                            dep_id,
                            t0.elapsed().as_millis() as u64,
                            stats.usage,
                        ),
                    }
                    return Ok(stats);
                }
                Err(e) => {
                    warn!(deployment = %dep_id, error = %e, "stream never started — trying next");
                    self.record_failure(dep_id, &e.to_string());
                    last_err = Some(e);
                }
            }
        }
        Err(GatewayError::Exhausted {
            model: decision.model_id.clone(),
            last: Box::new(last_err.unwrap_or_else(|| {
                GatewayError::Internal("decision contained no executable deployment".into())
            })),
        })
    }

    fn record_success(&self, deployment_id: &str, latency_ms: u64, usage: Option<Usage>) {
        self.deployments
            .update(deployment_id, |d| d.record_success(latency_ms, usage));
        if let Some(d) = self.deployments.get(deployment_id) {
            self.breaker_for(&d).record_success();
        }
    }

    fn record_failure(&self, deployment_id: &str, error: &str) {
        self.deployments.update(deployment_id, |d| d.record_failure(error));
        if let Some(d) = self.deployments.get(deployment_id) {
            self.breaker_for(&d).record_failure();
        }
    }
}

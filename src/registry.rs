//! Model and deployment registries — the catalogue the router selects from.
//!
//! Two independent id-keyed maps, each behind a single read-write lock:
//! selection reads clone snapshots under the read lock; all status and metric
//! mutation goes through [`DeploymentRegistry::update`], which holds the write
//! side so changes publish atomically. Registration is idempotent by id —
//! re-registering replaces the entry.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Usage;

/// Consecutive probe/request failures at which a deployment stops being
/// available, regardless of its healthy flag.
pub const MAX_CONSECUTIVE_FAILS: u32 = 3;

/// Smoothing factor for the latency EMA: `new = 0.9*old + 0.1*observed`.
const EMA_ALPHA: f64 = 0.1;

/// What a logical model can do, surfaced to catalogue readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub max_tokens: u32,
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_cost_per_mtok: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_cost_per_mtok: Option<f64>,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            streaming: true,
            input_cost_per_mtok: None,
            output_cost_per_mtok: None,
        }
    }
}

/// A logical model exposed to callers. Immutable after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub display_name: String,
    /// Family tag, e.g. `"llama"`, `"claude"`.
    pub family: String,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    /// Ordered deployment ids backing this model.
    pub deployments: Vec<String>,
}

/// Which provider implementation executes a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Gateway-style chat-completions dialect with per-channel keys.
    Gateway,
    /// Direct OpenAI-compatible endpoint, URL used verbatim. The baseline.
    Direct,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Gateway => "gateway",
            Self::Direct => "direct",
        })
    }
}

/// Authentication material for a deployment endpoint.
///
/// Secrets never appear in snapshots or logs: this type has no `Serialize`
/// implementation and its `Debug` output redacts everything but the variant.
#[derive(Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthConfig {
    ApiKey {
        key: String,
    },
    AwsIam {
        access_key_id: String,
        secret_access_key: String,
        region: String,
    },
    GcpOauth {
        service_account_json: String,
        #[serde(default)]
        token_url: Option<String>,
    },
    AzureAd {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    #[default]
    None,
}

impl AuthConfig {
    /// Bearer-token material, when this variant carries one.
    pub fn bearer_key(&self) -> Option<&str> {
        match self {
            Self::ApiKey { key } => Some(key),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::ApiKey { .. } => "api-key",
            Self::AwsIam { .. } => "aws-iam",
            Self::GcpOauth { .. } => "gcp-oauth",
            Self::AzureAd { .. } => "azure-ad",
            Self::None => "none",
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthConfig({})", self.kind_name())
    }
}

/// Endpoint configuration for one deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub deployment_name: Option<String>,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Extra headers sent verbatim with every request to this endpoint.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl EndpointConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: defaults::timeout_ms(),
            max_retries: 0,
            region: None,
            api_version: None,
            deployment_name: None,
            auth: AuthConfig::None,
            headers: HashMap::new(),
        }
    }
}

/// Health-tracking state mutated by the router and the health checker.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatus {
    /// Serving traffic. Cleared once `consecutive_fails` reaches the cap.
    pub available: bool,
    /// Strictly "the last probe succeeded".
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_fails: u32,
    pub last_error: Option<String>,
    /// Latency observed by the most recent probe, in milliseconds.
    pub latency_ms: u64,
}

impl Default for DeploymentStatus {
    fn default() -> Self {
        // Optimistic until the first probe sweep, so startup validation can
        // resolve transports before any probe has run.
        Self {
            available: true,
            healthy: true,
            last_check: None,
            last_success: None,
            consecutive_fails: 0,
            last_error: None,
            latency_ms: 0,
        }
    }
}

/// Aggregate counters mutated on every routed request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeploymentMetrics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Exponential moving average of request latency, in milliseconds.
    pub latency_ema_ms: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl DeploymentMetrics {
    /// Fold an observation into the EMA; the first observation seeds it.
    pub(crate) fn observe_latency(&mut self, latency_ms: u64) {
        if self.latency_ema_ms == 0.0 {
            self.latency_ema_ms = latency_ms as f64;
        } else {
            self.latency_ema_ms =
                (1.0 - EMA_ALPHA) * self.latency_ema_ms + EMA_ALPHA * latency_ms as f64;
        }
    }
}

/// A concrete endpoint-plus-credentials the router can address.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: String,
    /// Owning model id — must resolve in the [`ModelRegistry`].
    pub model_id: String,
    pub provider: ProviderKind,
    /// Model identifier sent on the provider wire.
    pub provider_model: String,
    pub endpoint: EndpointConfig,
    /// Lower wins under the priority strategy.
    pub priority: u32,
    /// Sampling weight under the weighted strategy.
    pub weight: u32,
    pub status: DeploymentStatus,
    pub metrics: DeploymentMetrics,
    pub tags: HashMap<String, String>,
}

impl Deployment {
    /// Whether this is the guaranteed-present fallback of last resort.
    pub fn is_baseline(&self) -> bool {
        self.tags.get("mode").is_some_and(|m| m == "baseline")
    }

    /// Availability as the router's candidate filter sees it.
    pub fn selectable(&self) -> bool {
        self.status.available && self.status.consecutive_fails < MAX_CONSECUTIVE_FAILS
    }

    /// Record a successful request: counters, EMA, token usage, health reset.
    pub fn record_success(&mut self, latency_ms: u64, usage: Option<Usage>) {
        self.metrics.requests += 1;
        self.metrics.successes += 1;
        self.metrics.observe_latency(latency_ms);
        if let Some(u) = usage {
            self.metrics.prompt_tokens += u64::from(u.prompt_tokens);
            self.metrics.completion_tokens += u64::from(u.completion_tokens);
        }
        self.status.consecutive_fails = 0;
        self.status.available = true;
        self.status.last_success = Some(Utc::now());
        self.status.last_error = None;
        self.status.latency_ms = latency_ms;
    }

    /// Record a failed request; the third consecutive failure clears availability.
    pub fn record_failure(&mut self, error: &str) {
        self.metrics.requests += 1;
        self.metrics.failures += 1;
        self.status.consecutive_fails += 1;
        self.status.last_error = Some(error.to_string());
        if self.status.consecutive_fails >= MAX_CONSECUTIVE_FAILS && !self.is_baseline() {
            self.status.available = false;
        }
    }

    /// Serializable view for `/routing_table` — carries no credentials.
    pub fn snapshot(&self) -> DeploymentSnapshot {
        DeploymentSnapshot {
            id: self.id.clone(),
            model_id: self.model_id.clone(),
            provider: self.provider,
            provider_model: self.provider_model.clone(),
            base_url: self.endpoint.base_url.clone(),
            auth_kind: self.endpoint.auth.kind_name(),
            priority: self.priority,
            weight: self.weight,
            status: self.status.clone(),
            metrics: self.metrics.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Credential-free deployment view.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentSnapshot {
    pub id: String,
    pub model_id: String,
    pub provider: ProviderKind,
    pub provider_model: String,
    pub base_url: String,
    pub auth_kind: &'static str,
    pub priority: u32,
    pub weight: u32,
    pub status: DeploymentStatus,
    pub metrics: DeploymentMetrics,
    pub tags: HashMap<String, String>,
}

/// id → [`Model`] map.
#[derive(Default)]
pub struct ModelRegistry {
    inner: RwLock<HashMap<String, Model>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a model by id.
    pub fn register(&self, model: Model) {
        self.inner
            .write()
            .expect("model registry lock poisoned")
            .insert(model.id.clone(), model);
    }

    pub fn get(&self, id: &str) -> Option<Model> {
        self.inner
            .read()
            .expect("model registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .read()
            .expect("model registry lock poisoned")
            .contains_key(id)
    }

    pub fn list(&self) -> Vec<Model> {
        let mut models: Vec<Model> = self
            .inner
            .read()
            .expect("model registry lock poisoned")
            .values()
            .cloned()
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("model registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// id → [`Deployment`] map.
#[derive(Default)]
pub struct DeploymentRegistry {
    inner: RwLock<HashMap<String, Deployment>>,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a deployment by id.
    pub fn register(&self, deployment: Deployment) {
        self.inner
            .write()
            .expect("deployment registry lock poisoned")
            .insert(deployment.id.clone(), deployment);
    }

    pub fn get(&self, id: &str) -> Option<Deployment> {
        self.inner
            .read()
            .expect("deployment registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Deployment> {
        let mut all: Vec<Deployment> = self
            .inner
            .read()
            .expect("deployment registry lock poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// All deployments owned by `model_id`, sorted by id for determinism.
    pub fn for_model(&self, model_id: &str) -> Vec<Deployment> {
        let mut owned: Vec<Deployment> = self
            .inner
            .read()
            .expect("deployment registry lock poisoned")
            .values()
            .filter(|d| d.model_id == model_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.id.cmp(&b.id));
        owned
    }

    /// Subset of [`Self::for_model`] that passes the availability filter.
    pub fn healthy_for_model(&self, model_id: &str) -> Vec<Deployment> {
        self.for_model(model_id)
            .into_iter()
            .filter(Deployment::selectable)
            .collect()
    }

    /// Reverse lookup: the deployment whose provider-side model id matches.
    pub fn find_by_provider_model(&self, provider_model: &str) -> Option<Deployment> {
        let inner = self.inner.read().expect("deployment registry lock poisoned");
        let mut matches: Vec<&Deployment> = inner
            .values()
            .filter(|d| d.provider_model == provider_model)
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches.first().map(|d| (*d).clone())
    }

    /// Mutate a deployment under the write lock, publishing atomically.
    ///
    /// Returns `false` when the id is unknown.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut Deployment)) -> bool {
        let mut inner = self.inner.write().expect("deployment registry lock poisoned");
        match inner.get_mut(id) {
            Some(d) => {
                f(d);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("deployment registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

mod defaults {
    pub fn timeout_ms() -> u64 {
        30_000
    }
}

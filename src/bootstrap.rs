//! Assembly of the core from declarative config.
//!
//! [`build`] is a plain function returning the fully wired state — no hidden
//! globals, so tests instantiate private copies. Regardless of what the config
//! declares, baseline credentials in the environment always add one
//! always-healthy direct deployment at priority 999, which is what makes
//! "no healthy deployments" a rare condition instead of a likely one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing::info;

use crate::config::{BaselineConfig, Config};
use crate::dns::tunnel::{SessionStore, TunnelEngine};
use crate::facade::ChatService;
use crate::health::HealthChecker;
use crate::profiles::{self, Transport};
use crate::providers::{DirectProvider, GatewayProvider, ProviderClient};
use crate::registry::{
    AuthConfig, Deployment, DeploymentMetrics, DeploymentRegistry, DeploymentStatus,
    EndpointConfig, Model, ModelCapabilities, ModelRegistry, ProviderKind,
};
use crate::router::Router;

/// Reserved id of the injected baseline deployment.
pub const BASELINE_DEPLOYMENT_ID: &str = "baseline";

/// Everything the transport adapters share.
pub struct AppState {
    pub config: Arc<Config>,
    pub models: Arc<ModelRegistry>,
    pub deployments: Arc<DeploymentRegistry>,
    pub router: Arc<Router>,
    pub chat: Arc<ChatService>,
    pub sessions: Arc<SessionStore>,
    pub tunnel: Arc<TunnelEngine>,
    pub started_at: Instant,
}

/// Build registries, providers, router, façade, and session store from
/// config. The health checker is returned unstarted so the caller controls
/// its lifecycle.
pub fn build(config: Config) -> anyhow::Result<(AppState, HealthChecker)> {
    let models = Arc::new(ModelRegistry::new());
    let deployments = Arc::new(DeploymentRegistry::new());

    // Deployment ids per model, preserving declaration order.
    let mut by_model: HashMap<String, Vec<String>> = HashMap::new();
    for dc in &config.deployments {
        by_model.entry(dc.model.clone()).or_default().push(dc.id.clone());
    }
    for mc in config.models.clone() {
        let owned = by_model.remove(&mc.id).unwrap_or_default();
        models.register(mc.into_model(owned));
    }
    for dc in config.deployments.clone() {
        deployments.register(dc.into_deployment(config.gateway.url.as_deref()));
    }

    let mut providers: HashMap<ProviderKind, Arc<ProviderClient>> = HashMap::new();
    providers.insert(
        ProviderKind::Gateway,
        Arc::new(ProviderClient::Gateway(GatewayProvider::new(config.gateway.clone()))),
    );

    if let Some(baseline) = &config.baseline {
        register_baseline(&models, &deployments, baseline);
        providers
            .entry(ProviderKind::Direct)
            .or_insert_with(|| Arc::new(ProviderClient::Direct(DirectProvider::new())));
        info!(model = %baseline.model, "baseline deployment registered");
    }

    let router = Arc::new(Router::new(
        Arc::clone(&models),
        Arc::clone(&deployments),
        providers.clone(),
        config.routing.strategy,
    ));
    let chat = Arc::new(ChatService::new(Arc::clone(&router)));
    let sessions = Arc::new(SessionStore::new());
    let tunnel = Arc::new(TunnelEngine::new(Arc::clone(&sessions), Arc::clone(&chat)));
    let health = HealthChecker::new(Arc::clone(&deployments), providers);

    info!(
        models = models.len(),
        deployments = deployments.len(),
        strategy = %config.routing.strategy,
        "core assembled"
    );

    let state = AppState {
        config: Arc::new(config),
        models,
        deployments,
        router,
        chat,
        sessions,
        tunnel,
        started_at: Instant::now(),
    };
    Ok((state, health))
}

/// Create (or extend) the baseline model and register its deployment.
fn register_baseline(
    models: &ModelRegistry,
    deployments: &DeploymentRegistry,
    baseline: &BaselineConfig,
) {
    match models.get(&baseline.model) {
        Some(mut model) => {
            if !model.deployments.iter().any(|d| d == BASELINE_DEPLOYMENT_ID) {
                model.deployments.push(BASELINE_DEPLOYMENT_ID.to_string());
                models.register(model);
            }
        }
        None => {
            let family = baseline
                .model
                .split(['-', ':'])
                .next()
                .unwrap_or("unknown")
                .to_string();
            models.register(Model {
                id: baseline.model.clone(),
                display_name: baseline.model.clone(),
                family,
                capabilities: ModelCapabilities::default(),
                deployments: vec![BASELINE_DEPLOYMENT_ID.to_string()],
            });
        }
    }

    let mut endpoint = EndpointConfig::new(baseline.url.clone());
    if let Some(key) = &baseline.key {
        endpoint.auth = AuthConfig::ApiKey { key: key.clone() };
    }
    deployments.register(Deployment {
        id: BASELINE_DEPLOYMENT_ID.to_string(),
        model_id: baseline.model.clone(),
        provider: ProviderKind::Direct,
        provider_model: baseline.model.clone(),
        endpoint,
        priority: 999,
        weight: 10,
        status: DeploymentStatus::default(),
        metrics: DeploymentMetrics::default(),
        tags: HashMap::from([("mode".to_string(), "baseline".to_string())]),
    });
}

/// Startup validation: every named transport must resolve to a routable
/// model. The baseline deployment is what makes the default profile pass.
pub fn validate_transports(state: &AppState) -> anyhow::Result<()> {
    for transport in Transport::ALL {
        let profile = profiles::resolve(transport);
        state
            .router
            .route(&profile.model, "startup-validation")
            .with_context(|| {
                format!(
                    "transport {transport} resolves to model `{}` which is not routable",
                    profile.model
                )
            })?;
    }
    Ok(())
}

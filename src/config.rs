//! Configuration for omnigate.
//!
//! The declarative part — models, deployments, routing policy, listener
//! settings — is loaded once at startup from a TOML file and validated before
//! any port opens. Credentials never live in the file: gateway channel keys,
//! the baseline endpoint, the tunnel zone, and the port mode are all read from
//! the environment in [`Config::apply_env`]. Invalid configs are rejected with
//! a clear error rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [server]
//! zone = "q.example.com"
//!
//! [routing]
//! strategy = "weighted"
//!
//! [[models]]
//! id = "claude-3.5-haiku"
//! family = "claude"
//!
//! [[deployments]]
//! id             = "haiku-gw"
//! model          = "claude-3.5-haiku"
//! provider_model = "claude-3.5-haiku"
//! priority       = 5
//! weight         = 50
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::registry::{
    AuthConfig, Deployment, DeploymentMetrics, DeploymentStatus, EndpointConfig, Model,
    ModelCapabilities, ProviderKind,
};
use crate::router::Strategy;

/// Top-level configuration: declarative file content plus environment-derived
/// credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    /// Logical model catalogue.
    #[serde(default)]
    pub models: Vec<ModelConfig>,

    /// Concrete deployments backing the models.
    #[serde(default)]
    pub deployments: Vec<DeploymentConfig>,

    /// Gateway provider credentials — environment only, never in the file.
    #[serde(skip)]
    pub gateway: GatewayCredentials,

    /// Baseline endpoint — environment only.
    #[serde(skip)]
    pub baseline: Option<BaselineConfig>,
}

impl Config {
    /// Load from `path`, fold in the environment, validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment-only configuration for file-less deployments.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Fold environment variables into the config (see §6.5 of the docs):
    /// `GATEWAY_URL` / `GATEWAY_KEY*`, `BASIC_FALLBACK_*`, `DNS_TUNNEL_ZONE`,
    /// `HIGH_PORT_MODE`.
    pub fn apply_env(&mut self) {
        self.gateway = GatewayCredentials::from_env();
        self.baseline = BaselineConfig::from_env();
        if let Ok(zone) = std::env::var("DNS_TUNNEL_ZONE") {
            if !zone.is_empty() {
                self.server.tunnel_zone = Some(normalize_zone(&zone));
            }
        }
        if env_flag("HIGH_PORT_MODE") {
            self.server.high_port_mode = true;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut model_ids = std::collections::HashSet::new();
        for model in &self.models {
            anyhow::ensure!(
                model_ids.insert(model.id.as_str()),
                "duplicate model id `{}`",
                model.id
            );
        }

        let mut deployment_ids = std::collections::HashSet::new();
        for dep in &self.deployments {
            anyhow::ensure!(
                deployment_ids.insert(dep.id.as_str()),
                "duplicate deployment id `{}`",
                dep.id
            );
            anyhow::ensure!(
                model_ids.contains(dep.model.as_str()),
                "deployment `{}` references unknown model `{}`",
                dep.id,
                dep.model
            );
            if dep.provider == ProviderKind::Gateway {
                anyhow::ensure!(
                    dep.base_url.is_some() || self.gateway.url.is_some(),
                    "deployment `{}` has no base_url and GATEWAY_URL is unset",
                    dep.id
                );
            } else {
                anyhow::ensure!(
                    dep.base_url.is_some(),
                    "direct deployment `{}` requires an explicit base_url",
                    dep.id
                );
            }
            anyhow::ensure!(dep.weight > 0, "deployment `{}` weight must be positive", dep.id);
        }
        Ok(())
    }

    /// The tunnel v2 zone suffix: `DNS_TUNNEL_ZONE` override or `qp.<zone>`.
    pub fn tunnel_zone(&self) -> String {
        self.server
            .tunnel_zone
            .clone()
            .unwrap_or_else(|| format!("qp.{}", self.server.zone))
    }
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP port. Unset: 80, or 8080 in high-port mode.
    #[serde(default)]
    pub http_port: Option<u16>,

    /// DNS UDP port. Unset: 53, or 8053 in high-port mode.
    #[serde(default)]
    pub dns_port: Option<u16>,

    /// Interactive shell TCP port. Unset: 23, or 2323 in high-port mode.
    #[serde(default)]
    pub shell_port: Option<u16>,

    /// Zone the plain-DNS adapter answers for.
    #[serde(default = "defaults::zone")]
    pub zone: String,

    /// Tunnel v2 zone suffix. Unset: `qp.<zone>`. Overridable with
    /// `DNS_TUNNEL_ZONE`.
    #[serde(default)]
    pub tunnel_zone: Option<String>,

    /// Bind only unprivileged ports. Set by the `HIGH_PORT_MODE` env var.
    #[serde(default)]
    pub high_port_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: None,
            dns_port: None,
            shell_port: None,
            zone: defaults::zone(),
            tunnel_zone: None,
            high_port_mode: false,
        }
    }
}

impl ServerConfig {
    pub fn http_port(&self) -> u16 {
        self.http_port.unwrap_or(if self.high_port_mode { 8080 } else { 80 })
    }

    pub fn dns_port(&self) -> u16 {
        self.dns_port.unwrap_or(if self.high_port_mode { 8053 } else { 53 })
    }

    pub fn shell_port(&self) -> u16 {
        self.shell_port.unwrap_or(if self.high_port_mode { 2323 } else { 23 })
    }
}

/// Routing policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub strategy: Strategy,
}

/// A logical model entry in the file.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default = "defaults::model_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "defaults::streaming")]
    pub streaming: bool,
    #[serde(default)]
    pub input_cost_per_mtok: Option<f64>,
    #[serde(default)]
    pub output_cost_per_mtok: Option<f64>,
}

impl ModelConfig {
    /// Materialize a registry [`Model`], given its deployment ids.
    pub fn into_model(self, deployments: Vec<String>) -> Model {
        let family = self
            .family
            .unwrap_or_else(|| self.id.split(['-', ':']).next().unwrap_or("unknown").to_string());
        Model {
            display_name: self.display_name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            family,
            capabilities: ModelCapabilities {
                max_tokens: self.max_tokens,
                streaming: self.streaming,
                input_cost_per_mtok: self.input_cost_per_mtok,
                output_cost_per_mtok: self.output_cost_per_mtok,
            },
            deployments,
        }
    }
}

/// A deployment entry in the file.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    pub id: String,
    /// Owning model id (must exist in `[[models]]`).
    pub model: String,
    #[serde(default = "defaults::provider")]
    pub provider: ProviderKind,
    /// Model identifier sent on the provider wire.
    pub provider_model: String,
    /// Unset for gateway deployments: `GATEWAY_URL` is used.
    #[serde(default)]
    pub base_url: Option<String>,
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
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "defaults::priority")]
    pub priority: u32,
    #[serde(default = "defaults::weight")]
    pub weight: u32,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl DeploymentConfig {
    /// Materialize a registry [`Deployment`]. `gateway_url` fills in the base
    /// URL for gateway deployments that leave it unset.
    pub fn into_deployment(self, gateway_url: Option<&str>) -> Deployment {
        let base_url = self
            .base_url
            .or_else(|| gateway_url.map(String::from))
            .unwrap_or_default();
        Deployment {
            id: self.id,
            model_id: self.model,
            provider: self.provider,
            provider_model: self.provider_model,
            endpoint: EndpointConfig {
                base_url,
                timeout_ms: self.timeout_ms,
                max_retries: self.max_retries,
                region: self.region,
                api_version: self.api_version,
                deployment_name: self.deployment_name,
                auth: self.auth,
                headers: self.headers,
            },
            priority: self.priority,
            weight: self.weight,
            status: DeploymentStatus::default(),
            metrics: DeploymentMetrics::default(),
            tags: self.tags,
        }
    }
}

/// Gateway provider credentials, resolved from the environment at startup.
#[derive(Clone, Default)]
pub struct GatewayCredentials {
    /// Base URL of the upstream gateway (`GATEWAY_URL`).
    pub url: Option<String>,
    /// Key used when no channel matches (`GATEWAY_KEY`).
    pub default_key: Option<String>,
    /// Per-channel keys (`GATEWAY_KEY_OPENAI` → `openai`, …).
    pub channel_keys: HashMap<String, String>,
}

impl GatewayCredentials {
    pub fn from_env() -> Self {
        let url = non_empty_var("GATEWAY_URL");
        let default_key = non_empty_var("GATEWAY_KEY");
        let channel_keys = std::env::vars()
            .filter_map(|(name, value)| {
                let channel = name.strip_prefix("GATEWAY_KEY_")?;
                if channel.is_empty() || value.is_empty() {
                    return None;
                }
                Some((channel.to_ascii_lowercase(), value))
            })
            .collect();
        Self { url, default_key, channel_keys }
    }
}

impl std::fmt::Debug for GatewayCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayCredentials")
            .field("url", &self.url)
            .field("default_key", &self.default_key.as_ref().map(|_| "<redacted>"))
            .field("channels", &{
                let mut names: Vec<&String> = self.channel_keys.keys().collect();
                names.sort();
                names
            })
            .finish()
    }
}

/// Baseline endpoint definition from `BASIC_FALLBACK_URL/KEY/MODEL`.
#[derive(Clone)]
pub struct BaselineConfig {
    /// Full chat-completions endpoint, used verbatim.
    pub url: String,
    /// Optional: keyless local endpoints are allowed.
    pub key: Option<String>,
    /// Logical (and wire) model id for the baseline.
    pub model: String,
}

impl BaselineConfig {
    pub fn from_env() -> Option<Self> {
        let url = non_empty_var("BASIC_FALLBACK_URL")?;
        let model = non_empty_var("BASIC_FALLBACK_MODEL")?;
        Some(Self { url, key: non_empty_var("BASIC_FALLBACK_KEY"), model })
    }
}

impl std::fmt::Debug for BaselineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaselineConfig")
            .field("url", &self.url)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .finish()
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
}

/// Strip a leading dot and any trailing dot from a zone suffix.
fn normalize_zone(zone: &str) -> String {
    zone.trim_start_matches('.').trim_end_matches('.').to_ascii_lowercase()
}

mod defaults {
    use crate::registry::ProviderKind;

    pub fn zone() -> String {
        "llm.internal".to_string()
    }
    pub fn model_max_tokens() -> u32 {
        4096
    }
    pub fn streaming() -> bool {
        true
    }
    pub fn provider() -> ProviderKind {
        ProviderKind::Gateway
    }
    pub fn timeout_ms() -> u64 {
        30_000
    }
    pub fn priority() -> u32 {
        100
    }
    pub fn weight() -> u32 {
        1
    }
}

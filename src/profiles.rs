//! Per-transport service profiles.
//!
//! Each transport resolves to a model id plus generation parameters through
//! the same env-override-with-defaults pattern: `<PREFIX>_LLM_MODEL` falls
//! back to `BASIC_FALLBACK_MODEL` and finally to the built-in default, while
//! max tokens and temperature have per-transport defaults tuned to the wire
//! constraints (DNS answers must fit in a handful of TXT strings; tunneled
//! answers can run long).

use crate::types::RequestParams;

/// Model id used when neither the transport override nor the basic fallback
/// is configured.
pub const FALLBACK_MODEL: &str = "llama-8b";

/// The transports the gateway serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Dns,
    Shell,
    TunnelV1,
    TunnelV2,
}

impl Transport {
    pub const ALL: [Transport; 4] =
        [Transport::Dns, Transport::Shell, Transport::TunnelV1, Transport::TunnelV2];

    /// Environment-variable prefix for this transport's overrides.
    fn env_prefix(self) -> &'static str {
        match self {
            Self::Dns => "DNS",
            Self::Shell => "SSH",
            Self::TunnelV1 => "DNS_TUNNEL",
            Self::TunnelV2 => "DNS_TUNNEL_V2",
        }
    }

    fn default_max_tokens(self) -> u32 {
        match self {
            Self::Dns => 200,
            Self::Shell => 1000,
            Self::TunnelV1 => 500,
            Self::TunnelV2 => 2000,
        }
    }

    fn default_temperature(self) -> f64 {
        match self {
            Self::Dns => 0.3,
            _ => 0.7,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Dns => "dns",
            Self::Shell => "shell",
            Self::TunnelV1 => "dns-tunnel-v1",
            Self::TunnelV2 => "dns-tunnel-v2",
        })
    }
}

/// Resolved profile: which model a transport talks to, and how.
#[derive(Debug, Clone)]
pub struct ServiceProfile {
    pub transport: Transport,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl ServiceProfile {
    pub fn params(&self) -> RequestParams {
        RequestParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: None,
            stop: None,
        }
    }
}

/// Resolve a transport's profile from the process environment.
pub fn resolve(transport: Transport) -> ServiceProfile {
    resolve_with(transport, |name| std::env::var(name).ok().filter(|v| !v.is_empty()))
}

/// Model for callers that don't name one and have no transport profile of
/// their own (the HTTP front door).
pub fn default_model() -> String {
    std::env::var("BASIC_FALLBACK_MODEL")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| FALLBACK_MODEL.to_string())
}

/// Resolution against an arbitrary variable source; unit tests inject a map
/// here so they never race on the process environment.
fn resolve_with(
    transport: Transport,
    get: impl Fn(&str) -> Option<String>,
) -> ServiceProfile {
    let prefix = transport.env_prefix();
    let model = get(&format!("{prefix}_LLM_MODEL"))
        .or_else(|| get("BASIC_FALLBACK_MODEL"))
        .unwrap_or_else(|| FALLBACK_MODEL.to_string());
    let max_tokens = get(&format!("{prefix}_LLM_MAX_TOKENS"))
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| transport.default_max_tokens());
    let temperature = get(&format!("{prefix}_LLM_TEMPERATURE"))
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| transport.default_temperature());
    ServiceProfile { transport, model, max_tokens, temperature }
}

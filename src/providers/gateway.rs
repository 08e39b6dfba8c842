//! Gateway-dialect provider.
//!
//! Talks to an upstream multi-model gateway that speaks the chat-completions
//! protocol on `<base_url>/v1/chat/completions` and authenticates with
//! per-channel API keys. The channel is chosen from the deployment's
//! `channel` tag when present, otherwise inferred from the provider-side
//! model id prefix:
//!
//! | Prefix | Channel |
//! |---|---|
//! | `gpt-3*`, `gpt-4*` | `openai` |
//! | `claude-*` | `anthropic` |
//! | `gemini-*` | `google` |
//! | `llama-*` | `azure` |

use crate::config::GatewayCredentials;
use crate::error::GatewayError;
use crate::registry::Deployment;
use crate::types::{ChatRequest, ChatResponse, StreamSink};

use super::{build_clients, post_chat, post_chat_stream, StreamStats};

/// Adapter for the gateway dialect. One instance serves every gateway
/// deployment; clients are shared (§ resource model) and per-request timeouts
/// come from each deployment's endpoint config.
pub struct GatewayProvider {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    credentials: GatewayCredentials,
}

impl GatewayProvider {
    pub fn new(credentials: GatewayCredentials) -> Self {
        let (client, stream_client) = build_clients();
        Self { client, stream_client, credentials }
    }

    /// The chat-completions URL for a deployment.
    fn url(deployment: &Deployment) -> String {
        format!(
            "{}/v1/chat/completions",
            deployment.endpoint.base_url.trim_end_matches('/')
        )
    }

    /// Resolve the API key for a deployment.
    ///
    /// Order: explicit `channel` tag → model-prefix channel → the
    /// deployment's own auth material → the credentials' default key.
    fn api_key<'a>(&'a self, deployment: &'a Deployment) -> Option<&'a str> {
        let tagged = deployment
            .tags
            .get("channel")
            .and_then(|c| self.credentials.channel_keys.get(c.as_str()));
        if let Some(key) = tagged {
            return Some(key);
        }
        if let Some(channel) = channel_for_model(&deployment.provider_model) {
            if let Some(key) = self.credentials.channel_keys.get(channel) {
                return Some(key);
            }
        }
        deployment
            .endpoint
            .auth
            .bearer_key()
            .or(self.credentials.default_key.as_deref())
    }

    pub async fn execute(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
    ) -> Result<ChatResponse, GatewayError> {
        let url = Self::url(deployment);
        post_chat(&self.client, &url, self.api_key(deployment), request, deployment).await
    }

    pub async fn stream(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        sink: &StreamSink,
    ) -> Result<StreamStats, GatewayError> {
        let url = Self::url(deployment);
        post_chat_stream(
            &self.stream_client,
            &url,
            self.api_key(deployment),
            request,
            deployment,
            sink,
        )
        .await
    }
}

/// Map a provider-side model id prefix to a gateway key channel.
pub(crate) fn channel_for_model(model: &str) -> Option<&'static str> {
    if model.starts_with("gpt-3") || model.starts_with("gpt-4") {
        Some("openai")
    } else if model.starts_with("claude-") {
        Some("anthropic")
    } else if model.starts_with("gemini-") {
        Some("google")
    } else if model.starts_with("llama-") {
        Some("azure")
    } else {
        None
    }
}

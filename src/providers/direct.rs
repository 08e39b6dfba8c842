//! Direct OpenAI-compatible provider — the baseline.
//!
//! Same contract as the gateway adapter with two differences: the
//! deployment's base URL is already a full chat-completions endpoint and is
//! used verbatim (no path suffix), and the API key comes straight from the
//! deployment's auth material with no channel mapping. Intended as the
//! fallback of last resort behind a pre-supplied endpoint.

use crate::error::GatewayError;
use crate::registry::Deployment;
use crate::types::{ChatRequest, ChatResponse, StreamSink};

use super::{build_clients, post_chat, post_chat_stream, StreamStats};

pub struct DirectProvider {
    client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl DirectProvider {
    pub fn new() -> Self {
        let (client, stream_client) = build_clients();
        Self { client, stream_client }
    }

    pub async fn execute(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
    ) -> Result<ChatResponse, GatewayError> {
        post_chat(
            &self.client,
            &deployment.endpoint.base_url,
            deployment.endpoint.auth.bearer_key(),
            request,
            deployment,
        )
        .await
    }

    pub async fn stream(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        sink: &StreamSink,
    ) -> Result<StreamStats, GatewayError> {
        post_chat_stream(
            &self.stream_client,
            &deployment.endpoint.base_url,
            deployment.endpoint.auth.bearer_key(),
            request,
            deployment,
            sink,
        )
        .await
    }
}

impl Default for DirectProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::test_deployment;
    use crate::registry::AuthConfig;
    use crate::types::ChatMessage;

    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatRequest {
        ChatRequest {
            model: "llama-8b".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.7,
            max_tokens: 50,
            top_p: None,
            stop: None,
            stream: false,
        }
    }

    #[tokio::test]
    async fn execute_uses_base_url_verbatim() {
        let server = MockServer::start().await;
        // The configured URL already includes the full path — nothing appended.
        Mock::given(method("POST"))
            .and(path("/api/v2/complete"))
            .and(header("authorization", "Bearer sk-baseline"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "from baseline"}, "finish_reason": "stop"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut dep = test_deployment("baseline", "llama-8b");
        dep.endpoint.base_url = format!("{}/api/v2/complete", server.uri());
        dep.endpoint.auth = AuthConfig::ApiKey { key: "sk-baseline".into() };

        let resp = DirectProvider::new().execute(&request(), &dep).await.unwrap();
        assert_eq!(resp.text(), "from baseline");
    }

    #[tokio::test]
    async fn execute_omits_authorization_without_key_material() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "open endpoint"}, "finish_reason": "stop"}]
            })))
            .mount(&server)
            .await;

        let mut dep = test_deployment("baseline", "llama-8b");
        dep.endpoint.base_url = server.uri();
        dep.endpoint.auth = AuthConfig::None;

        let resp = DirectProvider::new().execute(&request(), &dep).await.unwrap();
        assert_eq!(resp.text(), "open endpoint");
        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("authorization").is_none());
    }
}

//! Plain-DNS Q&A: TXT queries as one-shot prompts.
//!
//! `what-is-a-b-tree.q.example.com TXT` turns the label sequence into a
//! natural-language prompt (hyphens become spaces), runs it through the
//! router with the DNS profile, and packs the answer into a TXT record. A
//! hard deadline bounds the answer: whatever has streamed in by then is
//! truncated and marked with an ellipsis, because a resolver that has
//! already waited four seconds will retry or give up.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::facade::{ChatService, Prompt};
use crate::profiles::{self, Transport};

/// Hard ceiling on DNS response time.
pub const RESPONSE_DEADLINE: Duration = Duration::from_secs(4);

/// Byte cap on the final answer, ellipsis included.
pub const MAX_ANSWER_BYTES: usize = 500;

const TRUNCATION_MARKER: &str = "...";

/// Length-capping instruction prepended to the prompt.
const POLICY_PREFIX: &str = "Answer briefly, in plain text, in under 480 characters: ";

/// Answer a plain TXT query with the default deadline.
pub async fn answer(chat: Arc<ChatService>, labels: &[&str]) -> String {
    answer_by(chat, labels, Instant::now() + RESPONSE_DEADLINE).await
}

/// Deadline-parameterized variant (tests shorten it).
pub async fn answer_by(chat: Arc<ChatService>, labels: &[&str], deadline: Instant) -> String {
    let prompt = prompt_from_labels(labels);
    if prompt.is_empty() {
        return "ERROR: empty query".to_string();
    }
    debug!(%prompt, "plain dns query");

    let profile = profiles::resolve(Transport::Dns);
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(async move {
        let _ = chat
            .complete_stream(
                Prompt::Text(format!("{POLICY_PREFIX}{prompt}")),
                &profile.model,
                profile.params(),
                tx,
            )
            .await;
    });

    let mut collected = String::new();
    let mut deadline_hit = false;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(chunk)) => {
                if let Some(error) = chunk.error {
                    if collected.is_empty() {
                        return format!("ERROR: {error}");
                    }
                    break;
                }
                collected.push_str(&chunk.data);
                if chunk.done {
                    break;
                }
            }
            // Sink closed without a terminal chunk; take what we have.
            Ok(None) => break,
            Err(_) => {
                deadline_hit = true;
                break;
            }
        }
    }
    // Dropping `rx` cancels the upstream stream: the provider's next send
    // fails and it stops reading.

    if deadline_hit || collected.len() > MAX_ANSWER_BYTES {
        truncate_with_ellipsis(&collected)
    } else {
        collected
    }
}

/// Labels joined with spaces, hyphens mapped to spaces.
pub fn prompt_from_labels(labels: &[&str]) -> String {
    labels
        .iter()
        .filter(|l| !l.is_empty())
        .map(|l| l.replace('-', " "))
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

/// First ≤497 bytes (on a char boundary) plus the ellipsis marker.
fn truncate_with_ellipsis(text: &str) -> String {
    let budget = MAX_ANSWER_BYTES - TRUNCATION_MARKER.len();
    let end = text
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|&i| i <= budget)
        .last()
        .unwrap_or(0);
    format!("{}{TRUNCATION_MARKER}", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayCredentials;
    use crate::providers::{GatewayProvider, ProviderClient};
    use crate::registry::tests::{test_deployment, test_model};
    use crate::registry::{DeploymentRegistry, ModelRegistry, ProviderKind};
    use crate::router::{Router, Strategy};
    use std::collections::HashMap;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service_for(server_uri: &str) -> Arc<ChatService> {
        // Plain DNS resolves to "llama-8b" absent env overrides.
        let models = Arc::new(ModelRegistry::new());
        models.register(test_model("llama-8b", &["d1"]));
        let registry = Arc::new(DeploymentRegistry::new());
        let mut dep = test_deployment("d1", "llama-8b");
        dep.endpoint.base_url = server_uri.to_string();
        registry.register(dep);
        let mut providers = HashMap::new();
        providers.insert(
            ProviderKind::Gateway,
            Arc::new(ProviderClient::Gateway(GatewayProvider::new(
                GatewayCredentials::default(),
            ))),
        );
        Arc::new(ChatService::new(Arc::new(Router::new(
            models,
            registry,
            providers,
            Strategy::Priority,
        ))))
    }

    fn sse_answer(fragments: &[&str]) -> String {
        let mut body = String::new();
        for f in fragments {
            body.push_str(&format!(
                "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{f}\"}}}}]}}\n\n"
            ));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    // -----------------------------------------------------------------------
    // Prompt construction
    // -----------------------------------------------------------------------

    #[test]
    fn hyphens_become_spaces_and_labels_join() {
        assert_eq!(prompt_from_labels(&["what-is-a-b-tree"]), "what is a b tree");
        assert_eq!(prompt_from_labels(&["why-is", "the-sky-blue"]), "why is the sky blue");
        assert_eq!(prompt_from_labels(&[]), "");
        assert_eq!(prompt_from_labels(&[""]), "");
    }

    // -----------------------------------------------------------------------
    // Truncation
    // -----------------------------------------------------------------------

    #[test]
    fn truncation_keeps_497_bytes_plus_ellipsis() {
        let long = "x".repeat(600);
        let out = truncate_with_ellipsis(&long);
        assert_eq!(out.len(), MAX_ANSWER_BYTES);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert_eq!(&out[..497], &long[..497]);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "ü".repeat(400); // 2 bytes each; 497 is mid-char
        let out = truncate_with_ellipsis(&long);
        assert!(out.len() <= MAX_ANSWER_BYTES);
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    // -----------------------------------------------------------------------
    // End-to-end answering
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn fast_answer_is_returned_whole() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_answer(&["A B-tree is a ", "balanced search tree."])),
            )
            .mount(&server)
            .await;

        let chat = service_for(&server.uri());
        let out = answer(chat, &["what-is-a-b-tree"]).await;
        assert_eq!(out, "A B-tree is a balanced search tree.");
    }

    #[tokio::test]
    async fn slow_stream_is_cut_at_the_deadline_with_ellipsis() {
        let server = MockServer::start().await;
        // The whole response is delayed past the (shortened) deadline, so
        // nothing arrives in time and truncation kicks in on what did: the
        // empty prefix plus the marker.
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_answer(&["too late"]))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let chat = service_for(&server.uri());
        let out =
            answer_by(chat, &["slow-question"], Instant::now() + Duration::from_millis(50)).await;
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn oversized_answer_is_truncated_even_under_deadline() {
        let server = MockServer::start().await;
        let long = "y".repeat(700);
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_answer(&[&long])),
            )
            .mount(&server)
            .await;

        let chat = service_for(&server.uri());
        let out = answer(chat, &["big-question"]).await;
        assert_eq!(out.len(), MAX_ANSWER_BYTES);
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn routing_failure_surfaces_as_error_text() {
        // Service with empty registries: routing fails immediately.
        let models = Arc::new(ModelRegistry::new());
        let registry = Arc::new(DeploymentRegistry::new());
        let chat = Arc::new(ChatService::new(Arc::new(Router::new(
            models,
            registry,
            HashMap::new(),
            Strategy::Priority,
        ))));
        let out = answer(chat, &["anything"]).await;
        assert!(out.starts_with("ERROR:"), "got: {out}");
    }
}

//! Provider contract and shared chat-completions wire machinery.
//!
//! [`ProviderClient`] is an enum that wraps a concrete adapter chosen at
//! registration time. All routing code interacts with the same three-method
//! API (`execute`, `stream`, `health_check`); adapter differences — URL
//! resolution, key selection — live in the adapter modules. The wire schema
//! itself (OpenAI-style chat completions) and the `data:`-line event-stream
//! decoder are shared here, because both adapters speak the same dialect.

mod direct;
mod gateway;

pub use direct::DirectProvider;
pub use gateway::GatewayProvider;

use std::sync::OnceLock;
use std::time::Duration;

use futures_util::StreamExt as _;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::registry::Deployment;
use crate::types::{ChatMessage, ChatRequest, ChatResponse, Choice, StreamChunk, StreamSink, Usage};

/// Unified client — enum dispatch over concrete provider adapters.
pub enum ProviderClient {
    /// Gateway-style chat-completions dialect with per-channel API keys.
    Gateway(GatewayProvider),
    /// Direct OpenAI-compatible endpoint; the fallback of last resort.
    Direct(DirectProvider),
}

impl ProviderClient {
    /// Translate and execute a buffered request against `deployment`.
    pub async fn execute(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
    ) -> Result<ChatResponse, GatewayError> {
        match self {
            Self::Gateway(p) => p.execute(request, deployment).await,
            Self::Direct(p) => p.execute(request, deployment).await,
        }
    }

    /// Drive a streaming request, forwarding decoded fragments to `sink`.
    ///
    /// An `Err` return means the stream never started (safe to fail over);
    /// once fragments have been sent, mid-stream failures are reported via
    /// [`StreamStats::mid_error`] instead.
    pub async fn stream(
        &self,
        request: &ChatRequest,
        deployment: &Deployment,
        sink: &StreamSink,
    ) -> Result<StreamStats, GatewayError> {
        match self {
            Self::Gateway(p) => p.stream(request, deployment, sink).await,
            Self::Direct(p) => p.stream(request, deployment, sink).await,
        }
    }

    /// Probe `deployment` with a minimal one-message request.
    pub async fn health_check(&self, deployment: &Deployment) -> Result<(), GatewayError> {
        let probe = ChatRequest {
            model: deployment.model_id.clone(),
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.0,
            max_tokens: 8,
            top_p: None,
            stop: None,
            stream: false,
        };
        self.execute(&probe, deployment).await.map(|_| ())
    }
}

/// Outcome of a completed (or mid-stream-failed) streaming request.
#[derive(Debug, Default)]
pub struct StreamStats {
    /// Number of data fragments forwarded to the sink.
    pub chunks: u64,
    /// Concatenated fragment content, kept for token estimation.
    pub content: String,
    /// Usage as reported by the provider, or estimated from `content`.
    pub usage: Option<Usage>,
    /// Set when the stream broke after fragments were already delivered.
    pub mid_error: Option<String>,
}

// ──────────────────────────────────────────────────────────────────────────────
// Wire schema (OpenAI chat-completions dialect)
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub(crate) struct WireRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<&'a [String]>,
    pub stream: bool,
}

impl<'a> WireRequest<'a> {
    /// Build the provider-side body: the deployment's wire model id is
    /// substituted for the logical one.
    pub(crate) fn build(request: &'a ChatRequest, deployment: &'a Deployment, stream: bool) -> Self {
        Self {
            model: &deployment.provider_model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            stop: request.stop.as_deref(),
            stream,
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct WireStreamEvent {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireStreamChoice {
    delta: WireDelta,
}

#[derive(Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Parse a non-streaming provider body into the unified response.
pub(crate) fn parse_response(
    deployment_id: &str,
    logical_model: &str,
    body: &str,
) -> Result<ChatResponse, GatewayError> {
    let wire: WireResponse = serde_json::from_str(body).map_err(|e| GatewayError::Parse {
        deployment: deployment_id.to_string(),
        message: format!("invalid JSON body: {e}"),
    })?;
    if wire.choices.is_empty() {
        return Err(GatewayError::Parse {
            deployment: deployment_id.to_string(),
            message: "response carries no choices".into(),
        });
    }
    let choices = wire
        .choices
        .into_iter()
        .map(|c| Choice {
            message: ChatMessage::assistant(c.message.content.unwrap_or_default()),
            finish_reason: c.finish_reason,
        })
        .collect();
    Ok(ChatResponse {
        model: logical_model.to_string(),
        choices,
        usage: wire.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }),
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// Shared HTTP execution
// ──────────────────────────────────────────────────────────────────────────────

/// Build the pair of shared reqwest clients an adapter needs: one with no
/// request timeout for streaming (bodies arrive incrementally), plus a bounded
/// idle-connection pool on both. Per-request timeouts come from the
/// deployment's endpoint config.
pub(crate) fn build_clients() -> (reqwest::Client, reqwest::Client) {
    let buffered = reqwest::Client::builder()
        .pool_max_idle_per_host(8)
        .build()
        .expect("failed to build reqwest client");
    let streaming = reqwest::Client::builder()
        .pool_max_idle_per_host(8)
        .build()
        .expect("failed to build streaming reqwest client");
    (buffered, streaming)
}

fn apply_headers(
    mut req: reqwest::RequestBuilder,
    bearer: Option<&str>,
    deployment: &Deployment,
) -> reqwest::RequestBuilder {
    if let Some(key) = bearer {
        req = req.bearer_auth(key);
    }
    for (name, value) in &deployment.endpoint.headers {
        req = req.header(name, value);
    }
    req
}

/// POST a buffered chat-completions request and parse the unified response.
pub(crate) async fn post_chat(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    request: &ChatRequest,
    deployment: &Deployment,
) -> Result<ChatResponse, GatewayError> {
    let body = WireRequest::build(request, deployment, false);
    let response = apply_headers(client.post(url), bearer, deployment)
        .timeout(Duration::from_millis(deployment.endpoint.timeout_ms))
        .json(&body)
        .send()
        .await
        .map_err(|e| transport_error(&deployment.id, url, e))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| transport_error(&deployment.id, url, e))?;

    if !status.is_success() {
        return Err(GatewayError::from_status(&deployment.id, status, &text));
    }
    parse_response(&deployment.id, &request.model, &text)
}

/// POST a streaming chat-completions request and pump decoded fragments into
/// `sink` until the `[DONE]` sentinel, the connection drops, or the receiver
/// goes away (caller cancellation).
pub(crate) async fn post_chat_stream(
    stream_client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    request: &ChatRequest,
    deployment: &Deployment,
    sink: &StreamSink,
) -> Result<StreamStats, GatewayError> {
    let body = WireRequest::build(request, deployment, true);
    let response = apply_headers(stream_client.post(url), bearer, deployment)
        .json(&body)
        .send()
        .await
        .map_err(|e| transport_error(&deployment.id, url, e))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(GatewayError::from_status(&deployment.id, status, &text));
    }

    let mut stats = StreamStats::default();
    let mut decoder = SseDecoder::default();
    let mut upstream = response.bytes_stream();
    let mut finished = false;

    'outer: while let Some(item) = upstream.next().await {
        let bytes = match item {
            Ok(b) => b,
            Err(e) => {
                stats.mid_error = Some(format!("stream from {url} broke: {e}"));
                break;
            }
        };
        for event in decoder.feed(&bytes) {
            match event {
                SseEvent::Done => {
                    finished = true;
                    break 'outer;
                }
                SseEvent::Data(payload) => {
                    let parsed: WireStreamEvent = match serde_json::from_str(&payload) {
                        Ok(p) => p,
                        Err(e) => {
                            stats.mid_error = Some(format!("malformed stream event: {e}"));
                            break 'outer;
                        }
                    };
                    if let Some(u) = parsed.usage {
                        stats.usage = Some(Usage {
                            prompt_tokens: u.prompt_tokens,
                            completion_tokens: u.completion_tokens,
                        });
                    }
                    let Some(fragment) =
                        parsed.choices.into_iter().next().and_then(|c| c.delta.content)
                    else {
                        continue;
                    };
                    if fragment.is_empty() {
                        continue;
                    }
                    stats.content.push_str(&fragment);
                    stats.chunks += 1;
                    if sink.send(StreamChunk::data(fragment)).await.is_err() {
                        // Receiver gone — the caller cancelled. Stop reading.
                        finished = true;
                        break 'outer;
                    }
                }
            }
        }
    }

    if !finished && stats.mid_error.is_none() {
        stats.mid_error = Some("stream ended without a [DONE] sentinel".into());
    }
    if stats.usage.is_none() {
        stats.usage = Some(Usage {
            prompt_tokens: 0,
            completion_tokens: estimate_tokens(&stats.content),
        });
    }
    Ok(stats)
}

fn transport_error(deployment: &str, url: &str, e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::ProviderTransient {
            deployment: deployment.to_string(),
            message: format!("timed out calling {url}"),
        }
    } else {
        GatewayError::ProviderTransient {
            deployment: deployment.to_string(),
            message: format!("transport error calling {url}: {e}"),
        }
    }
}

/// Estimate completion tokens for providers that stream without a usage block.
pub(crate) fn estimate_tokens(text: &str) -> u32 {
    static BPE: OnceLock<Option<tiktoken_rs::CoreBPE>> = OnceLock::new();
    match BPE.get_or_init(|| tiktoken_rs::cl100k_base().ok()) {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        // Tokenizer data unavailable — fall back to the ~4 bytes/token rule.
        None => (text.len() / 4) as u32,
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// SSE decoding
// ──────────────────────────────────────────────────────────────────────────────

pub(crate) enum SseEvent {
    Data(String),
    Done,
}

/// Incremental decoder for a `data: <json>`-per-line event stream.
///
/// Bytes arrive in arbitrary chunk boundaries; anything after the last
/// newline is buffered until the next feed. Non-`data:` lines (comments,
/// `event:` fields, blanks) are ignored.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buf: String,
}

impl SseDecoder {
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim_start();
            if payload == "[DONE]" {
                events.push(SseEvent::Done);
            } else if !payload.is_empty() {
                events.push(SseEvent::Data(payload.to_string()));
            }
        }
        events
    }
}

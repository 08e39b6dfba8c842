//! The single entrypoint every transport adapter calls.
//!
//! [`ChatService`] turns heterogeneous inputs — a bare prompt string or a
//! pre-built message sequence — into a unified request, applies parameter
//! defaults, mints the request id, and drives the router. Routing failures
//! are returned as-is (wrapped with the request context); the requested model
//! id is never silently substituted. For streaming calls the service
//! guarantees the sink observes exactly one terminal chunk and is then
//! closed, whatever happened upstream.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::router::Router;
use crate::types::{ChatMessage, ChatRequest, ChatResponse, RequestParams, StreamChunk, StreamSink};

pub const DEFAULT_MAX_TOKENS: u32 = 500;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Transport-side input: a bare string becomes a single user message.
pub enum Prompt {
    Text(String),
    Messages(Vec<ChatMessage>),
}

impl Prompt {
    fn into_messages(self) -> Vec<ChatMessage> {
        match self {
            Self::Text(text) => vec![ChatMessage::user(text)],
            Self::Messages(messages) => messages,
        }
    }
}

pub struct ChatService {
    router: Arc<Router>,
}

impl ChatService {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Execute a buffered request end-to-end.
    pub async fn complete(
        &self,
        prompt: Prompt,
        model_id: &str,
        params: RequestParams,
    ) -> Result<ChatResponse, GatewayError> {
        let request_id = Uuid::new_v4().to_string();
        let request = build_request(prompt, model_id, &params, false);
        debug!(%request_id, model = %model_id, "completion request");

        let decision = self
            .router
            .route(model_id, &request_id)
            .map_err(|e| wrap(e, &request_id, model_id))?;
        self.router
            .execute(&request, &decision)
            .await
            .map_err(|e| wrap(e, &request_id, model_id))
    }

    /// Execute a streaming request, forwarding fragments to `sink`.
    ///
    /// The sink always receives a terminal chunk — [`StreamChunk::done`] on
    /// success, [`StreamChunk::failed`] otherwise — and is closed when this
    /// returns (all senders dropped).
    pub async fn complete_stream(
        &self,
        prompt: Prompt,
        model_id: &str,
        params: RequestParams,
        sink: StreamSink,
    ) -> Result<(), GatewayError> {
        let request_id = Uuid::new_v4().to_string();
        let request = build_request(prompt, model_id, &params, true);
        debug!(%request_id, model = %model_id, "streaming request");

        let decision = match self.router.route(model_id, &request_id) {
            Ok(d) => d,
            Err(e) => {
                let wrapped = wrap(e, &request_id, model_id);
                let _ = sink.send(StreamChunk::failed(wrapped.to_string())).await;
                return Err(wrapped);
            }
        };

        match self.router.execute_stream(&request, &decision, &sink).await {
            Ok(stats) => {
                let terminal = match stats.mid_error {
                    Some(mid) => StreamChunk::failed(mid),
                    None => StreamChunk::done(),
                };
                let _ = sink.send(terminal).await;
                Ok(())
            }
            Err(e) => {
                let wrapped = wrap(e, &request_id, model_id);
                let _ = sink.send(StreamChunk::failed(wrapped.to_string())).await;
                Err(wrapped)
            }
        }
    }
}

fn build_request(
    prompt: Prompt,
    model_id: &str,
    params: &RequestParams,
    stream: bool,
) -> ChatRequest {
    let max_tokens = if params.max_tokens == 0 { DEFAULT_MAX_TOKENS } else { params.max_tokens };
    let temperature =
        if params.temperature <= 0.0 { DEFAULT_TEMPERATURE } else { params.temperature };
    ChatRequest {
        model: model_id.to_string(),
        messages: prompt.into_messages(),
        temperature,
        max_tokens,
        top_p: params.top_p,
        stop: params.stop.clone(),
        stream,
    }
}

fn wrap(e: GatewayError, request_id: &str, model: &str) -> GatewayError {
    GatewayError::Request {
        request_id: request_id.to_string(),
        model: model.to_string(),
        source: Box::new(e),
    }
}

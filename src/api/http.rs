//! HTTP transport adapter.
//!
//! Two request shapes reach the router: the plain query form (`GET /?q=…`,
//! `POST /` with form fields) answered as streamed text, and the
//! chat-completions JSON form on `POST /v1/chat/completions` answered as a
//! completion object or an SSE stream terminated by `data: [DONE]`. This is
//! intentionally a thin layer — all routing logic lives behind
//! [`crate::facade::ChatService`]; handlers translate HTTP concerns (status
//! codes, framing, flushing) and nothing else.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use bytes::Bytes;
use futures_util::StreamExt as _;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::bootstrap::AppState;
use crate::error::{AppError, GatewayError};
use crate::facade::Prompt;
use crate::profiles;
use crate::types::{ChatMessage, RequestParams, StreamChunk};

const USAGE: &str = "omnigate — ask with GET /?q=your+question or POST /v1/chat/completions\n";

const TERMS: &str = "This gateway relays prompts to third-party language models. \
No conversation content is stored. Answers are generated text and may be wrong.\n";

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_get).post(root_post))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/routing_table", get(routing_table))
        .route("/terms_of_service", get(terms_of_service))
        .with_state(state)
}

#[derive(Deserialize)]
struct RootQuery {
    q: Option<String>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct RootForm {
    q: Option<String>,
    /// Conversation-so-far textarea: `Q:`/`A:`-prefixed lines.
    h: Option<String>,
    model: Option<String>,
    // Present in the form the static UI posts; the core keeps no session
    // state, so they are accepted and ignored.
    #[allow(dead_code)]
    session: Option<String>,
    #[allow(dead_code)]
    seq: Option<String>,
}

/// `GET /?q=…` — plain-text streamed answer.
async fn root_get(State(state): State<Arc<AppState>>, Query(query): Query<RootQuery>) -> Response {
    ask(state, query.q, None, query.model).await
}

/// `POST /` with form fields `q` and optional history `h`.
async fn root_post(State(state): State<Arc<AppState>>, Form(form): Form<RootForm>) -> Response {
    ask(state, form.q, form.h, form.model).await
}

async fn ask(
    state: Arc<AppState>,
    q: Option<String>,
    history: Option<String>,
    model: Option<String>,
) -> Response {
    let Some(q) = q.map(|q| q.trim().to_string()).filter(|q| !q.is_empty()) else {
        return (axum::http::StatusCode::OK, USAGE).into_response();
    };
    let messages = history_messages(history.as_deref(), &q);
    let model = model.filter(|m| !m.is_empty()).unwrap_or_else(profiles::default_model);

    let (tx, rx) = tokio::sync::mpsc::channel::<StreamChunk>(64);
    let chat = Arc::clone(&state.chat);
    tokio::spawn(async move {
        let _ = chat
            .complete_stream(Prompt::Messages(messages), &model, RequestParams::default(), tx)
            .await;
    });

    let body_stream = chunk_stream(rx).filter_map(|chunk| async move {
        if let Some(error) = chunk.error {
            return Some(Ok::<_, Infallible>(Bytes::from(format!("\nerror: {error}\n"))));
        }
        if chunk.data.is_empty() {
            return None;
        }
        Some(Ok(Bytes::from(chunk.data)))
    });

    (
        [("content-type", "text/plain; charset=utf-8"), ("cache-control", "no-store")],
        Body::from_stream(body_stream),
    )
        .into_response()
}

/// Rebuild a message sequence from the history textarea plus the new query.
///
/// History lines starting `Q: ` are user turns and `A: ` assistant turns;
/// unprefixed lines continue the previous turn.
fn history_messages(history: Option<&str>, q: &str) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = Vec::new();
    if let Some(history) = history {
        for line in history.lines() {
            if let Some(text) = line.strip_prefix("Q: ") {
                messages.push(ChatMessage::user(text));
            } else if let Some(text) = line.strip_prefix("A: ") {
                messages.push(ChatMessage::assistant(text));
            } else if let Some(last) = messages.last_mut() {
                last.content.push('\n');
                last.content.push_str(line);
            }
        }
    }
    messages.push(ChatMessage::user(q));
    messages
}

#[derive(Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub stop: Option<Vec<String>>,
}

/// `POST /v1/chat/completions` — buffered JSON or SSE per the `stream` flag.
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatCompletionRequest>,
) -> Result<Response, AppError> {
    if body.model.is_empty() {
        return Err(GatewayError::BadRequest("`model` is required".into()).into());
    }
    if body.messages.is_empty() {
        return Err(GatewayError::BadRequest("`messages` must not be empty".into()).into());
    }
    let params = RequestParams {
        max_tokens: body.max_tokens.unwrap_or(0),
        temperature: body.temperature.unwrap_or(0.0),
        top_p: body.top_p,
        stop: body.stop,
    };

    if !body.stream {
        let response = state
            .chat
            .complete(Prompt::Messages(body.messages), &body.model, params)
            .await?;
        let completion = json!({
            "id": format!("chatcmpl-{}", Uuid::new_v4()),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": response.model,
            "choices": response.choices.iter().enumerate().map(|(i, c)| json!({
                "index": i,
                "message": { "role": "assistant", "content": c.message.content },
                "finish_reason": c.finish_reason,
            })).collect::<Vec<_>>(),
            "usage": response.usage.map(|u| json!({
                "prompt_tokens": u.prompt_tokens,
                "completion_tokens": u.completion_tokens,
                "total_tokens": u.total(),
            })),
        });
        return Ok(Json(completion).into_response());
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<StreamChunk>(64);
    let chat = Arc::clone(&state.chat);
    let model = body.model.clone();
    tokio::spawn(async move {
        let _ = chat.complete_stream(Prompt::Messages(body.messages), &model, params, tx).await;
    });

    let stream_model = body.model;
    let events = chunk_stream(rx)
        .flat_map(move |chunk| futures_util::stream::iter(sse_events(chunk, &stream_model)))
        .map(Ok::<_, Infallible>);
    Ok(Sse::new(events).into_response())
}

/// Translate one sink chunk into its SSE events. Terminal chunks always end
/// the stream with the `[DONE]` sentinel.
fn sse_events(chunk: StreamChunk, model: &str) -> Vec<Event> {
    if let Some(error) = chunk.error {
        return vec![
            Event::default().data(json!({ "error": { "message": error } }).to_string()),
            Event::default().data("[DONE]"),
        ];
    }
    if chunk.done {
        return vec![Event::default().data("[DONE]")];
    }
    vec![Event::default().data(
        json!({
            "object": "chat.completion.chunk",
            "model": model,
            "choices": [{ "index": 0, "delta": { "content": chunk.data }, "finish_reason": null }],
        })
        .to_string(),
    )]
}

/// Adapt an mpsc receiver into a `futures` stream.
fn chunk_stream(
    rx: tokio::sync::mpsc::Receiver<StreamChunk>,
) -> impl futures_util::Stream<Item = StreamChunk> {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    })
}

/// `GET /v1/models` — the registered catalogue.
async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let data: Vec<_> = state
        .models
        .list()
        .into_iter()
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "owned_by": m.family,
                "omnigate": {
                    "display_name": m.display_name,
                    "deployments": m.deployments.len(),
                    "streaming": m.capabilities.streaming,
                },
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

/// `GET /health` — liveness plus registry counts.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let deployments = state.deployments.list();
    let healthy = deployments.iter().filter(|d| d.selectable()).count();
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "models": state.models.len(),
        "deployments": deployments.len(),
        "healthy_deployments": healthy,
        "strategy": state.router.strategy().to_string(),
        "zone": state.config.server.zone,
    }))
}

/// `GET /routing_table` — credential-free deployment snapshots.
async fn routing_table(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let table: Vec<_> = state.deployments.list().iter().map(|d| d.snapshot()).collect();
    Json(json!({
        "strategy": state.router.strategy().to_string(),
        "deployments": table,
    }))
}

async fn terms_of_service() -> impl IntoResponse {
    ([("content-type", "text/plain; charset=utf-8")], TERMS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BaselineConfig, Config, GatewayCredentials};

    use axum::body::to_bytes;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server_uri: Option<&str>) -> Config {
        let mut config: Config = toml::from_str(
            r#"
            [[models]]
            id = "claude-3.5-haiku"

            [[deployments]]
            id             = "haiku-gw"
            model          = "claude-3.5-haiku"
            provider_model = "claude-3.5-haiku"
            base_url       = "http://placeholder.invalid"
            priority       = 5
            "#,
        )
        .unwrap();
        if let Some(uri) = server_uri {
            config.deployments[0].base_url = Some(uri.to_string());
        }
        config.gateway = GatewayCredentials::default();
        config
    }

    fn app(config: Config) -> Router {
        let (state, _health) = crate::bootstrap::build(config).unwrap();
        router(Arc::new(state))
    }

    fn sse_body(fragments: &[&str]) -> String {
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
    // Introspection endpoints
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_reports_registry_counts() {
        let app = app(config_for(None));
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_slice(&to_bytes(resp.into_body(), usize::MAX).await.unwrap()).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["models"], 1);
        assert_eq!(body["deployments"], 1);
    }

    #[tokio::test]
    async fn models_endpoint_lists_the_catalogue() {
        let app = app(config_for(None));
        let resp = app
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(&to_bytes(resp.into_body(), usize::MAX).await.unwrap()).unwrap();
        assert_eq!(body["data"][0]["id"], "claude-3.5-haiku");
        assert_eq!(body["data"][0]["owned_by"], "claude");
    }

    #[tokio::test]
    async fn routing_table_carries_no_credentials() {
        let mut config = config_for(None);
        config.baseline = Some(BaselineConfig {
            url: "http://127.0.0.1:1/v1".into(),
            key: Some("sk-very-secret".into()),
            model: "llama-8b".into(),
        });
        let app = app(config);
        let resp = app
            .oneshot(Request::get("/routing_table").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("baseline"), "baseline row present");
        assert!(!text.contains("sk-very-secret"), "credentials must not leak");
    }

    // -----------------------------------------------------------------------
    // Chat completions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn chat_completions_returns_a_completion_object() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 2, "completion_tokens": 1}
            })))
            .mount(&server)
            .await;

        let app = app(config_for(Some(&server.uri())));
        let request = Request::post("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "model": "claude-3.5-haiku",
                    "messages": [{"role": "user", "content": "hi"}],
                })
                .to_string(),
            ))
            .unwrap();

        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_slice(&to_bytes(resp.into_body(), usize::MAX).await.unwrap()).unwrap();
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
        assert_eq!(body["usage"]["total_tokens"], 3);
    }

    #[tokio::test]
    async fn chat_completions_streams_sse_with_done_sentinel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body(&["Hel", "lo"])),
            )
            .mount(&server)
            .await;

        let app = app(config_for(Some(&server.uri())));
        let request = Request::post("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "model": "claude-3.5-haiku",
                    "messages": [{"role": "user", "content": "hi"}],
                    "stream": true,
                })
                .to_string(),
            ))
            .unwrap();

        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/event-stream"));

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("chat.completion.chunk"));
        assert!(text.contains("Hel"));
        assert!(text.trim_end().ends_with("data: [DONE]"), "stream ends with sentinel: {text}");
    }

    #[tokio::test]
    async fn missing_messages_is_a_bad_request() {
        let app = app(config_for(None));
        let request = Request::post("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "model": "claude-3.5-haiku", "messages": [] }).to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_model_maps_to_not_found() {
        let app = app(config_for(None));
        let request = Request::post("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "model": "ghost",
                    "messages": [{"role": "user", "content": "hi"}],
                })
                .to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    // -----------------------------------------------------------------------
    // Plain query form
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn root_without_query_shows_usage() {
        let app = app(config_for(None));
        let resp = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8(body.to_vec()).unwrap().contains("omnigate"));
    }

    #[tokio::test]
    async fn root_query_streams_the_answer_as_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body(&["streamed ", "answer"])),
            )
            .mount(&server)
            .await;

        let app = app(config_for(Some(&server.uri())));
        let resp = app
            .oneshot(
                Request::get("/?q=hello&model=claude-3.5-haiku").body(Body::empty()).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(String::from_utf8(body.to_vec()).unwrap(), "streamed answer");
    }

    // -----------------------------------------------------------------------
    // History parsing
    // -----------------------------------------------------------------------

    #[test]
    fn history_textarea_rebuilds_the_message_sequence() {
        let history = "Q: first question\nA: first answer\nwith a second line\nQ: second question";
        let messages = history_messages(Some(history), "third question");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].content, "first question");
        assert_eq!(messages[1].content, "first answer\nwith a second line");
        assert_eq!(messages[2].content, "second question");
        assert_eq!(messages[3].content, "third question");
    }

    #[test]
    fn empty_history_is_just_the_query() {
        let messages = history_messages(None, "only question");
        assert_eq!(messages.len(), 1);
    }
}

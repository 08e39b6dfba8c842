//! Unified chat data model shared by every transport and provider.
//!
//! All inbound traffic — HTTP, shell, DNS, tunneled DNS — is normalised into a
//! [`ChatRequest`] before it reaches the router, and every provider answer is
//! normalised back into a [`ChatResponse`]. Streaming responses travel as
//! [`StreamChunk`] values over a bounded mpsc channel whose closure marks the
//! end of the stream.

use serde::{Deserialize, Serialize};

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        })
    }
}

/// A single role-tagged message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// The unified request every transport produces and every provider consumes.
///
/// `model` is the *logical* model id; the provider substitutes the
/// deployment's provider-side model identifier when it builds the wire body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub stream: bool,
}

/// Caller-tunable generation parameters, applied by the façade with defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    /// Non-positive values are replaced with the façade default (500).
    pub max_tokens: u32,
    /// Non-positive values are replaced with the façade default (0.7).
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub stop: Option<Vec<String>>,
}

/// Token usage reported by (or estimated for) a completed request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One completion choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

/// The unified non-streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Echo of the logical model id the caller requested.
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Content of the first choice, or the empty string when no choice exists.
    pub fn text(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("")
    }
}

/// One element of a streaming response.
///
/// The terminal chunk has `done == true`; a failed stream carries the error
/// description on its terminal chunk. Exactly one terminal chunk is emitted
/// per stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub data: String,
    pub done: bool,
    pub error: Option<String>,
}

impl StreamChunk {
    pub fn data(fragment: impl Into<String>) -> Self {
        Self { data: fragment.into(), done: false, error: None }
    }

    pub fn done() -> Self {
        Self { data: String::new(), done: true, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { data: String::new(), done: true, error: Some(error.into()) }
    }
}

/// Producer side of a streaming response channel.
///
/// Closure (all senders dropped) is the end-of-stream signal consumers select
/// on; the façade guarantees the terminal [`StreamChunk`] is sent before the
/// last sender is dropped.
pub type StreamSink = tokio::sync::mpsc::Sender<StreamChunk>;

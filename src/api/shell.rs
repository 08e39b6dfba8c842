//! Interactive shell transport: a line-oriented TCP session.
//!
//! Unauthenticated by design (the authenticator is an out-of-scope shell
//! around this adapter). Every line becomes a user turn; the conversation
//! history lives only in the session task and dies with the connection.
//! Chunks are written as they arrive so the answer types itself out.

use std::sync::Arc;

use futures_util::StreamExt as _;
use tokio::io::AsyncWriteExt as _;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info};

use crate::bootstrap::AppState;
use crate::facade::Prompt;
use crate::profiles::{self, Transport};
use crate::types::ChatMessage;

const GREETING: &str =
    "omnigate shell — ask anything. `clear` resets history, `exit` leaves.\n";

const PROMPT: &str = "> ";

/// Longest accepted input line.
const MAX_LINE: usize = 64 * 1024;

/// Accept shell sessions forever.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "shell session opened");
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = session(stream, state).await {
                debug!(%peer, error = %e, "shell session ended");
            }
            info!(%peer, "shell session closed");
        });
    }
}

async fn session(stream: TcpStream, state: Arc<AppState>) -> anyhow::Result<()> {
    let (read_half, mut out) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE));

    out.write_all(GREETING.as_bytes()).await?;
    out.write_all(PROMPT.as_bytes()).await?;
    out.flush().await?;

    let profile = profiles::resolve(Transport::Shell);
    let mut history: Vec<ChatMessage> = Vec::new();

    while let Some(line) = lines.next().await {
        let line = line?;
        match line.trim() {
            "" => {}
            "exit" | "quit" => {
                out.write_all(b"bye\n").await?;
                break;
            }
            "clear" => {
                history.clear();
                out.write_all(b"history cleared\n").await?;
            }
            input => {
                history.push(ChatMessage::user(input));

                let (tx, mut rx) = tokio::sync::mpsc::channel(64);
                let chat = Arc::clone(&state.chat);
                let model = profile.model.clone();
                let params = profile.params();
                let messages = history.clone();
                tokio::spawn(async move {
                    let _ = chat
                        .complete_stream(Prompt::Messages(messages), &model, params, tx)
                        .await;
                });

                let mut reply = String::new();
                while let Some(chunk) = rx.recv().await {
                    if let Some(error) = chunk.error {
                        out.write_all(format!("\nerror: {error}").as_bytes()).await?;
                        break;
                    }
                    if !chunk.data.is_empty() {
                        out.write_all(chunk.data.as_bytes()).await?;
                        out.flush().await?;
                        reply.push_str(&chunk.data);
                    }
                    if chunk.done {
                        break;
                    }
                }
                if reply.is_empty() {
                    history.pop(); // failed turn leaves no trace
                } else {
                    history.push(ChatMessage::assistant(reply));
                }
                out.write_all(b"\n").await?;
            }
        }
        out.write_all(PROMPT.as_bytes()).await?;
        out.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GatewayCredentials};
    use std::time::Duration;

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Spawn a shell server over a freshly built state; answers come from a
    /// wiremock gateway backing the "llama-8b" model the shell profile
    /// resolves to.
    async fn shell_addr(server_uri: &str) -> std::net::SocketAddr {
        let mut config: Config = toml::from_str(
            r#"
            [[models]]
            id = "llama-8b"

            [[deployments]]
            id             = "llama-gw"
            model          = "llama-8b"
            provider_model = "llama-8b"
            base_url       = "http://placeholder.invalid"
            "#,
        )
        .unwrap();
        config.deployments[0].base_url = Some(server_uri.to_string());
        config.gateway = GatewayCredentials::default();

        let (state, _health) = crate::bootstrap::build(config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::new(state)));
        addr
    }

    /// Read from the socket until `marker` appears or the timeout hits.
    async fn read_until(stream: &mut TcpStream, marker: &str) -> String {
        let mut collected = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut buf = [0u8; 1024];
        while !collected.contains(marker) {
            let n = tokio::time::timeout_at(deadline, stream.read(&mut buf))
                .await
                .expect("read timed out")
                .expect("read failed");
            if n == 0 {
                break;
            }
            collected.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        collected
    }

    fn sse_body(answer: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{answer}\"}}}}]}}\n\ndata: [DONE]\n\n"
        )
    }

    #[tokio::test]
    async fn greets_and_exits() {
        let server = MockServer::start().await;
        let addr = shell_addr(&server.uri()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let greeting = read_until(&mut stream, PROMPT).await;
        assert!(greeting.contains("omnigate shell"));

        stream.write_all(b"exit\n").await.unwrap();
        let farewell = read_until(&mut stream, "bye").await;
        assert!(farewell.contains("bye"));
    }

    #[tokio::test]
    async fn question_streams_an_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body("forty-two")),
            )
            .mount(&server)
            .await;

        let addr = shell_addr(&server.uri()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        read_until(&mut stream, PROMPT).await;

        stream.write_all(b"what is the answer\n").await.unwrap();
        let out = read_until(&mut stream, "forty-two").await;
        assert!(out.contains("forty-two"));
    }

    #[tokio::test]
    async fn clear_resets_history() {
        let server = MockServer::start().await;
        let addr = shell_addr(&server.uri()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        read_until(&mut stream, PROMPT).await;

        stream.write_all(b"clear\n").await.unwrap();
        let out = read_until(&mut stream, "history cleared").await;
        assert!(out.contains("history cleared"));
    }
}

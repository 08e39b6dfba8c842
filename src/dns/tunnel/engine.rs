//! Tunnel v2 protocol engine.
//!
//! The operation is encoded in the leftmost labels of the queried name
//! (relative to the tunnel zone):
//!
//! | Shape | Operation |
//! |---|---|
//! | `<enc-pub>.<sig-pub>.init` | key exchange, session allocation |
//! | `<sid>.<idx>.<ciphertext>` | store one query page |
//! | `<sid>.<total>.exec` | start asynchronous execution |
//! | `<sid>.status` | poll: NOT_STARTED / PROCESSING / page 1 / FAILED |
//! | `<sid>.page.<N>` | fetch response page N (1-based) |
//!
//! Execution is decoupled from DNS response timing: `exec` answers
//! `PROCESSING` immediately and a background task runs the model, paginates
//! the answer, and encrypts each page under the session keystream. Binary
//! payloads are base32 in labels and base64 in TXT answers.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use crypto_box::aead::{Aead, AeadCore};
use crypto_box::SalsaBox;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore as _;
use tokio::sync::Mutex;
use tracing::{info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::GatewayError;
use crate::facade::{ChatService, Prompt};
use crate::profiles::{self, Transport};

use super::codec::{self, SESSION_ID_BYTES};
use super::keystream;
use super::session::{
    Session, SessionState, SessionStore, RESPONSE_NOT_STARTED, RESPONSE_PROCESSING,
};

/// Instruction prepended to every tunneled query before it reaches the model.
const EXEC_POLICY_PREFIX: &str = "Answer in detail, no markdown: ";

pub struct TunnelEngine {
    sessions: Arc<SessionStore>,
    chat: Arc<ChatService>,
}

impl TunnelEngine {
    pub fn new(sessions: Arc<SessionStore>, chat: Arc<ChatService>) -> Self {
        Self { sessions, chat }
    }

    /// Handle one tunnel query. Always answers: protocol violations come back
    /// as an `ERROR:` TXT string rather than a DNS-level failure.
    pub async fn handle(&self, labels: &[&str]) -> String {
        match self.dispatch(labels).await {
            Ok(answer) => answer,
            Err(e) => format!("ERROR: {e}"),
        }
    }

    async fn dispatch(&self, labels: &[&str]) -> Result<String, GatewayError> {
        match labels {
            &[enc, sig, "init"] => self.init(enc, sig).await,
            &[sid, "status"] => self.status(sid).await,
            &[sid, "page", n] => self.page(sid, n).await,
            &[sid, total, "exec"] => self.exec(sid, total).await,
            &[sid, idx, data] => self.query_page(sid, idx, data).await,
            _ => Err(GatewayError::Protocol(format!(
                "unrecognized query shape ({} labels)",
                labels.len()
            ))),
        }
    }

    fn session(&self, sid: &str) -> Result<Arc<Mutex<Session>>, GatewayError> {
        self.sessions
            .get(sid)
            .ok_or_else(|| GatewayError::Protocol(format!("unknown session id `{sid}`")))
    }

    /// Key exchange. The TXT answer is a fixed-width 3-digit length prefix,
    /// the base64 NaCl-box of the raw session id, then the server's two
    /// concatenated public keys in base32.
    async fn init(&self, enc_label: &str, sig_label: &str) -> Result<String, GatewayError> {
        let client_enc: [u8; 32] = codec::decode_label(enc_label)?
            .try_into()
            .map_err(|_| GatewayError::Protocol("client encryption key must be 32 bytes".into()))?;
        let client_sig: [u8; 32] = codec::decode_label(sig_label)?
            .try_into()
            .map_err(|_| GatewayError::Protocol("client signing key must be 32 bytes".into()))?;
        // The verification key is published but pages are accepted unsigned;
        // reject garbage here so later enforcement stays possible.
        ed25519_dalek::VerifyingKey::from_bytes(&client_sig)
            .map_err(|_| GatewayError::Protocol("client signing key is not a valid point".into()))?;

        let server_secret = StaticSecret::random_from_rng(OsRng);
        let server_enc_pub = PublicKey::from(&server_secret);
        let server_sig = SigningKey::generate(&mut OsRng);
        let server_sig_pub = server_sig.verifying_key().to_bytes();

        let shared_secret = server_secret.diffie_hellman(&PublicKey::from(client_enc));

        let mut session_id = [0u8; SESSION_ID_BYTES];
        OsRng.fill_bytes(&mut session_id);
        let sid = codec::encode_label(&session_id);

        let sealing = SalsaBox::new(
            &crypto_box::PublicKey::from(client_enc),
            &crypto_box::SecretKey::from(server_secret.to_bytes()),
        );
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let sealed = sealing
            .encrypt(&nonce, &session_id[..])
            .map_err(|_| GatewayError::Internal("session id encryption failed".into()))?;
        let mut boxed = nonce.to_vec();
        boxed.extend_from_slice(&sealed);
        let boxed_b64 = BASE64.encode(&boxed);

        let mut server_keys = [0u8; 64];
        server_keys[..32].copy_from_slice(server_enc_pub.as_bytes());
        server_keys[32..].copy_from_slice(&server_sig_pub);

        self.sessions.insert(Session::new(
            sid.clone(),
            client_enc,
            client_sig,
            *server_enc_pub.as_bytes(),
            server_sig_pub,
            *shared_secret.as_bytes(),
        ));
        info!(session = %sid, "tunnel session established");

        Ok(format!(
            "{:03}{}{}",
            boxed_b64.len(),
            boxed_b64,
            codec::encode_label(&server_keys)
        ))
    }

    /// Decrypt and store one query page.
    async fn query_page(
        &self,
        sid: &str,
        idx_label: &str,
        data_label: &str,
    ) -> Result<String, GatewayError> {
        let handle = self.session(sid)?;
        let idx_bytes = codec::decode_label(idx_label)?;
        let &[index] = &idx_bytes[..] else {
            return Err(GatewayError::Protocol("page index must be a single byte".into()));
        };
        let mut data = codec::decode_label(data_label)?;

        let mut session = handle.lock().await;
        match session.state {
            SessionState::Init => {}
            SessionState::Failed => {
                return Err(GatewayError::Protocol("session is in the failed state".into()))
            }
            _ => {
                return Err(GatewayError::Protocol(
                    "query pages cannot change after exec".into(),
                ))
            }
        }

        let key = keystream::derive(
            &session.shared_secret,
            &keystream::query_context(index),
            data.len(),
        );
        keystream::xor_in_place(&mut data, &key);
        session.query_pages.insert(index, data);
        session.touch();
        Ok("ACK".into())
    }

    /// Verify the page set, flip to PROCESSING, and kick off execution.
    async fn exec(&self, sid: &str, total_label: &str) -> Result<String, GatewayError> {
        let handle = self.session(sid)?;
        let total = decode_total(total_label)?;

        let query = {
            let mut session = handle.lock().await;
            match session.state {
                SessionState::Init => {}
                // A retried exec while the first is still running is answered
                // like a status poll rather than double-spawning.
                SessionState::Processing => return Ok("PROCESSING".into()),
                SessionState::Ready => {
                    return Err(GatewayError::Protocol("session already executed".into()))
                }
                SessionState::Failed => {
                    return Err(GatewayError::Protocol("session is in the failed state".into()))
                }
            }
            if session.query_pages.len() != total {
                return Err(GatewayError::Protocol(format!(
                    "expected {total} query pages, have {}",
                    session.query_pages.len()
                )));
            }
            let mut assembled = Vec::new();
            for i in 0..total {
                let page = session.query_pages.get(&(i as u8)).ok_or_else(|| {
                    GatewayError::Protocol(format!("query page {i} was never received"))
                })?;
                assembled.extend_from_slice(page);
            }
            session.begin_processing();
            String::from_utf8_lossy(&assembled).into_owned()
        };

        let chat = Arc::clone(&self.chat);
        tokio::spawn(run_exec(chat, handle, query));
        Ok("PROCESSING".into())
    }

    /// Status poll. Once ready, the answer is the already-encrypted first
    /// response page, base64-wrapped for the TXT payload.
    async fn status(&self, sid: &str) -> Result<String, GatewayError> {
        let handle = self.session(sid)?;
        let mut session = handle.lock().await;
        session.touch();
        if session.state == SessionState::Failed {
            return Ok("FAILED".into());
        }
        Ok(match session.response_total {
            RESPONSE_NOT_STARTED => "NOT_STARTED".into(),
            RESPONSE_PROCESSING => "PROCESSING".into(),
            _ => {
                let first = session.response_pages.get(&0).ok_or_else(|| {
                    GatewayError::Internal("ready session lost response page 0".into())
                })?;
                BASE64.encode(first)
            }
        })
    }

    /// Fetch response page N, 1-based on the wire.
    async fn page(&self, sid: &str, n_label: &str) -> Result<String, GatewayError> {
        let n: usize = n_label
            .parse()
            .map_err(|_| GatewayError::Protocol(format!("page number `{n_label}` is not decimal")))?;
        if n == 0 {
            return Err(GatewayError::Protocol("page numbers are 1-based".into()));
        }
        let handle = self.session(sid)?;
        let mut session = handle.lock().await;
        session.touch();
        if session.state == SessionState::Failed {
            return Ok("FAILED".into());
        }
        let page = session.response_pages.get(&(n - 1)).ok_or_else(|| {
            GatewayError::Protocol(format!("page {n} is not available"))
        })?;
        Ok(BASE64.encode(page))
    }
}

/// Background half of `exec`: run the model, paginate, frame, encrypt,
/// publish. Any failure flips the session to FAILED and scrubs it.
async fn run_exec(chat: Arc<ChatService>, handle: Arc<Mutex<Session>>, query: String) {
    let profile = profiles::resolve(Transport::TunnelV2);
    let prompt = format!("{EXEC_POLICY_PREFIX}{query}");

    match chat.complete(Prompt::Text(prompt), &profile.model, profile.params()).await {
        Ok(response) => {
            let pages = codec::paginate(response.text());
            let total = pages.len();
            let mut session = handle.lock().await;
            if session.state != SessionState::Processing {
                // The sweep already failed this session as stalled.
                return;
            }
            for (i, body) in pages.iter().enumerate() {
                let mut framed = codec::frame_page(i, total, body).into_bytes();
                let key = keystream::derive(
                    &session.shared_secret,
                    &keystream::response_context(i),
                    framed.len(),
                );
                keystream::xor_in_place(&mut framed, &key);
                session.response_pages.insert(i, framed);
            }
            session.finish(total);
        }
        Err(e) => {
            let mut session = handle.lock().await;
            warn!(session = %session.id, error = %e, "tunnel execution failed");
            session.fail();
        }
    }
}

/// Decode the exec total-pages label: big-endian base32 bytes, 1..=256.
fn decode_total(label: &str) -> Result<usize, GatewayError> {
    let bytes = codec::decode_label(label)?;
    if bytes.is_empty() || bytes.len() > 2 {
        return Err(GatewayError::Protocol(format!("bad total-pages label `{label}`")));
    }
    let total = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    if total == 0 || total > 256 {
        return Err(GatewayError::Protocol(format!("total pages {total} out of range")));
    }
    Ok(total)
}

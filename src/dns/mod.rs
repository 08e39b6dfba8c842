//! DNS front door: one UDP handler, two personalities.
//!
//! Queries under the tunnel zone go to the [`tunnel::TunnelEngine`]; queries
//! under the plain zone become one-shot prompts via [`plain`]. Everything is
//! answered as TXT with a 60 s TTL, content split into 255-byte strings.
//! Names outside both zones are refused — this server is authoritative only.

pub mod plain;
pub mod tunnel;

use std::sync::Arc;

use hickory_proto::op::{Header, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tracing::warn;

use crate::facade::ChatService;
use tunnel::TunnelEngine;

/// TTL on every TXT answer.
pub const TXT_TTL: u32 = 60;

/// A single character-string within a TXT record caps at 255 bytes.
pub const TXT_STRING_MAX: usize = 255;

pub struct DnsHandler {
    chat: Arc<ChatService>,
    tunnel: Arc<TunnelEngine>,
    /// Plain zone, lower-case, no trailing dot.
    zone: String,
    /// Tunnel zone suffix, lower-case, no trailing dot.
    tunnel_zone: String,
}

impl DnsHandler {
    pub fn new(
        chat: Arc<ChatService>,
        tunnel: Arc<TunnelEngine>,
        zone: &str,
        tunnel_zone: &str,
    ) -> Self {
        Self {
            chat,
            tunnel,
            zone: normalize(zone),
            tunnel_zone: normalize(tunnel_zone),
        }
    }

    /// Produce the TXT content for a queried name, or `None` when the name is
    /// outside both zones.
    async fn answer_for(&self, queried: &str) -> Option<String> {
        let name = normalize(queried);
        if let Some(prefix) = strip_zone(&name, &self.tunnel_zone) {
            let labels: Vec<&str> = prefix.split('.').filter(|l| !l.is_empty()).collect();
            Some(self.tunnel.handle(&labels).await)
        } else if let Some(prefix) = strip_zone(&name, &self.zone) {
            let labels: Vec<&str> = prefix.split('.').filter(|l| !l.is_empty()).collect();
            Some(plain::answer(Arc::clone(&self.chat), &labels).await)
        } else {
            None
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for DnsHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        if request.op_code() != OpCode::Query || request.message_type() != MessageType::Query {
            return refuse(request, response_handle, ResponseCode::NotImp).await;
        }
        let query = request.query();
        let record_type = query.query_type();
        if record_type != RecordType::TXT && record_type != RecordType::ANY {
            return refuse(request, response_handle, ResponseCode::Refused).await;
        }

        let name = query.original().name().clone();
        let Some(text) = self.answer_for(&name.to_string()).await else {
            return refuse(request, response_handle, ResponseCode::Refused).await;
        };

        let record = Record::from_rdata(name, TXT_TTL, RData::TXT(TXT::new(split_txt(&text))));
        let builder = MessageResponseBuilder::from_message_request(request);
        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        let response = builder.build(
            header,
            std::iter::once(&record),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );

        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "failed to send dns response");
                serv_fail()
            }
        }
    }
}

/// Run the DNS server on `socket` until it errors or the task is dropped.
pub async fn serve(socket: tokio::net::UdpSocket, handler: DnsHandler) -> anyhow::Result<()> {
    use anyhow::Context as _;
    let mut server = hickory_server::ServerFuture::new(handler);
    server.register_socket(socket);
    server.block_until_done().await.context("dns server error")
}

async fn refuse<R: ResponseHandler>(
    request: &Request,
    mut response_handle: R,
    code: ResponseCode,
) -> ResponseInfo {
    let builder = MessageResponseBuilder::from_message_request(request);
    let response = builder.error_msg(request.header(), code);
    match response_handle.send_response(response).await {
        Ok(info) => info,
        Err(e) => {
            warn!(error = %e, "failed to send dns refusal");
            serv_fail()
        }
    }
}

fn serv_fail() -> ResponseInfo {
    let mut header = Header::new();
    header.set_response_code(ResponseCode::ServFail);
    header.into()
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// The labels left of `zone`, or `None` when `name` is not under it.
fn strip_zone<'a>(name: &'a str, zone: &str) -> Option<&'a str> {
    if name == zone {
        return Some("");
    }
    name.strip_suffix(zone)?.strip_suffix('.')
}

/// Split TXT content into ≤255-byte character-strings on char boundaries.
pub(crate) fn split_txt(text: &str) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let mut strings = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let end = rest
            .char_indices()
            .map(|(i, c)| i + c.len_utf8())
            .take_while(|&i| i <= TXT_STRING_MAX)
            .last()
            .unwrap_or(rest.len().min(TXT_STRING_MAX));
        let (head, tail) = rest.split_at(end);
        strings.push(head.to_string());
        rest = tail;
    }
    strings
}

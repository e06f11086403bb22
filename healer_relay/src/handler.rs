//! WebSocket Connection Handler
//!
//! Authenticates the upgrade, then pumps frames between one client socket
//! and the hub.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use healer_env::HealerContext;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::admission::admit_envelope;
use crate::error::AdmissionError;
use crate::hub::PeerId;
use crate::protocol::{self, Frame};
use crate::server::RelayShared;

/// Identity presented on the upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
    pub client: Option<String>,
}

impl Credentials {
    /// Reads `token`/`client` from the query string and
    /// `Authorization: Bearer` from the headers (the header wins).
    pub fn from_request(request: &Request) -> Self {
        let mut token = None;
        let mut client = None;
        if let Some(query) = request.uri().query() {
            for (key, value) in form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "token" => token = Some(value.into_owned()),
                    "client" if !value.is_empty() => client = Some(value.into_owned()),
                    _ => {}
                }
            }
        }

        let bearer = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| v.trim().to_string());

        Credentials {
            token: bearer.or(token),
            client,
        }
    }

    /// Constant-shape comparison against the configured secret.
    pub fn authorized(&self, secret: &str) -> bool {
        match &self.token {
            Some(token) => token.len() == secret.len() && token.bytes().zip(secret.bytes()).all(|(a, b)| a == b),
            None => false,
        }
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("invalid or missing token".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Handles one TCP connection from upgrade to close.
pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<RelayShared>) {
    let mut identity: Option<String> = None;
    let secret = shared.config.token.clone();

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let credentials = Credentials::from_request(request);
        if !credentials.authorized(&secret) {
            return Err(unauthorized());
        }
        identity = Some(credentials.client.unwrap_or_else(|| addr.to_string()));
        Ok(response)
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Connection from {} refused: {}", addr, e);
            return;
        }
    };
    let Some(client) = identity else {
        return;
    };

    let (mut write, mut read) = ws_stream.split();
    let (peer, mut outbound) = shared.hub.register(client.clone(), shared.context.now_ms());

    // Single writer per socket: everything for this peer goes through the hub channel
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match frame.to_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode frame: {}", e);
                    continue;
                }
            };
            if write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                shared.hub.touch(peer, shared.context.now_ms());
                process_text(&shared, peer, &client, &text);
            }
            Ok(Message::Binary(data)) => {
                shared.hub.touch(peer, shared.context.now_ms());
                match String::from_utf8(data) {
                    Ok(text) => process_text(&shared, peer, &client, &text),
                    Err(_) => reject(&shared, peer, &client, AdmissionError::InvalidFrame("binary frame is not UTF-8".into())),
                }
            }
            Ok(Message::Close(_)) => {
                debug!("Client {} sent close", client);
                break;
            }
            Ok(_) => {
                // Ping/pong are answered by tungstenite
            }
            Err(e) => {
                warn!("Error from {}: {}", client, e);
                break;
            }
        }
    }

    // The bucket outlives the socket so reconnecting does not refill it
    shared.hub.unregister(peer);
    writer.abort();
}

/// Applies one inbound text frame.
pub(crate) fn process_text(shared: &RelayShared, peer: PeerId, client: &str, text: &str) {
    if text.len() > shared.config.max_message_bytes {
        reject(
            shared,
            peer,
            client,
            AdmissionError::InvalidFrame(format!("frame of {} bytes exceeds the limit", text.len())),
        );
        return;
    }

    if !shared.limiter.consume(client) {
        warn!("Rate limited: {}", client);
        shared.hub.record_rate_limited();
        shared.hub.send_to(
            peer,
            Frame::error(protocol::CODE_RATE_LIMITED, "too many messages, slow down"),
        );
        return;
    }

    let frame = match Frame::parse(text) {
        Ok(frame) => frame,
        Err(e) => return reject(shared, peer, client, e),
    };

    let now = shared.context.now_ms();
    match frame.event.as_str() {
        protocol::MESSAGE_SEND => {
            let result = admit_envelope(&frame.data, shared.config.max_attempt_limit)
                .and_then(|env| shared.hub.submit(peer, env, now));
            if let Err(e) = result {
                reject(shared, peer, client, e);
            }
        }
        protocol::MESSAGE_ACK => match frame.ack_id() {
            Ok(id) => {
                shared.hub.client_ack(peer, &id, now);
            }
            Err(e) => reject(shared, peer, client, e),
        },
        protocol::STATE_SYNC => {
            let forwarded = shared.hub.store_snapshot(peer, frame.data);
            debug!("Snapshot from {} forwarded to {} peers", client, forwarded);
        }
        protocol::STATE_UPDATE => {
            if !shared.hub.request_snapshot(peer) {
                debug!("No snapshot stored for {}", client);
            }
        }
        other => reject(shared, peer, client, AdmissionError::InvalidFrame(format!("unknown event `{}`", other))),
    }
}

fn reject(shared: &RelayShared, peer: PeerId, client: &str, error: AdmissionError) {
    warn!("Rejected frame from {}: {}", client, error);
    shared.hub.record_rejected();
    shared.hub.send_to(peer, Frame::error(error.code(), error.to_string()));
}

//! Socket transport: the relayed implementation of `Transport`.
//!
//! Envelopes travel as `message:send` frames to the relay, which fans them
//! out as `message:receive`. The relay never echoes a client's own envelope
//! back to it, except on relay retries.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use healer_env::{ContextId, EnvError, Envelope, Subscription, Transport};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use url::form_urlencoded;

use crate::protocol::{self, Frame};

type Inbox = std::sync::Arc<Mutex<Option<mpsc::UnboundedSender<Envelope>>>>;

/// WebSocket connection to a relay.
pub struct SocketTransport {
    local_id: ContextId,
    url: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbox: Inbox,
    /// Latest `state:sync` payload pushed by the relay
    snapshots: std::sync::Arc<Mutex<Option<Value>>>,
    /// `message:ack` receipts from the relay
    receipts: std::sync::Arc<AtomicU64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    open: AtomicBool,
}

impl SocketTransport {
    /// `base_url` is the relay's `ws://host:port` address. The full context
    /// UUID is the client identity the relay rate-limits on.
    pub fn new(base_url: &str, token: &str, local_id: ContextId) -> Self {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("token", token)
            .append_pair("client", &local_id.as_uuid().to_string())
            .finish();
        let url = format!("{}/?{}", base_url.trim_end_matches('/'), query);
        SocketTransport {
            local_id,
            url,
            outbound: Mutex::new(None),
            inbox: Default::default(),
            snapshots: Default::default(),
            receipts: Default::default(),
            tasks: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Relay receipts received so far.
    pub fn receipts(&self) -> u64 {
        self.receipts.load(Ordering::SeqCst)
    }

    /// Latest snapshot pushed by the relay.
    pub fn latest_snapshot(&self) -> Option<Value> {
        self.snapshots.lock().unwrap().clone()
    }

    /// Publishes a bulk snapshot (`state:sync`); not acknowledgment-tracked.
    pub fn publish_snapshot(&self, snapshot: Value) -> Result<(), EnvError> {
        self.push(Frame::state_sync(snapshot))
    }

    /// Asks the relay for its stored snapshot (`state:update`).
    pub fn request_snapshot(&self) -> Result<(), EnvError> {
        self.push(Frame::state_update())
    }

    fn push(&self, frame: Frame) -> Result<(), EnvError> {
        let text = frame.to_text()?;
        match self.outbound.lock().unwrap().as_ref() {
            Some(tx) => tx
                .send(Message::Text(text))
                .map_err(|_| EnvError::network("relay connection lost")),
            None => Err(EnvError::Closed),
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), EnvError> {
        if !self.is_open() {
            return Err(EnvError::Closed);
        }
        self.push(Frame::send(&envelope)?)
    }

    fn subscribe(&self) -> Result<Subscription, EnvError> {
        let (tx, subscription) = Subscription::channel();
        *self.inbox.lock().unwrap() = Some(tx);
        Ok(subscription)
    }

    async fn open(&self) -> Result<(), EnvError> {
        if self.is_open() {
            return Ok(());
        }

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| EnvError::network(format!("connect failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if write.send(message).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let inbox = std::sync::Arc::clone(&self.inbox);
        let snapshots = std::sync::Arc::clone(&self.snapshots);
        let receipts = std::sync::Arc::clone(&self.receipts);
        let local_id = self.local_id;
        let reader = tokio::spawn(async move {
            while let Some(Ok(message)) = read.next().await {
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let frame = match Frame::parse(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(context = %local_id, "unreadable frame from relay: {}", e);
                        continue;
                    }
                };
                match frame.event.as_str() {
                    protocol::MESSAGE_RECEIVE => match serde_json::from_value::<Envelope>(frame.data) {
                        Ok(envelope) => {
                            let subscriber = inbox.lock().unwrap().clone();
                            if let Some(tx) = subscriber {
                                let _ = tx.send(envelope);
                            }
                        }
                        Err(e) => warn!(context = %local_id, "bad envelope from relay: {}", e),
                    },
                    protocol::MESSAGE_ACK => {
                        receipts.fetch_add(1, Ordering::SeqCst);
                        trace!(context = %local_id, "relay receipt");
                    }
                    protocol::STATE_SYNC => {
                        *snapshots.lock().unwrap() = Some(frame.data);
                    }
                    protocol::ERROR => {
                        warn!(context = %local_id, code = ?frame.error_code(), "relay refused a frame");
                    }
                    other => debug!(context = %local_id, event = other, "ignored relay event"),
                }
            }
            debug!(context = %local_id, "relay connection ended");
        });

        *self.outbound.lock().unwrap() = Some(tx);
        self.tasks.lock().unwrap().extend([writer, reader]);
        self.open.store(true, Ordering::SeqCst);
        debug!(context = %self.local_id, "connected to relay");
        Ok(())
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.outbound.lock().unwrap().take() {
            let _ = tx.send(Message::Close(None));
        }
        self.inbox.lock().unwrap().take();
        // The writer drains the close frame and exits on its own
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks.into_iter().skip(1) {
            task.abort();
        }
    }

    fn local_id(&self) -> ContextId {
        self.local_id
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_carries_credentials() {
        let id = ContextId::from_seed(4);
        let transport = SocketTransport::new("ws://127.0.0.1:9000/", "secret", id);
        assert_eq!(
            transport.url,
            format!("ws://127.0.0.1:9000/?token=secret&client={}", id.as_uuid())
        );
        assert!(!transport.is_open());
    }

    #[test]
    fn test_url_escapes_token() {
        let id = ContextId::from_seed(4);
        let transport = SocketTransport::new("ws://127.0.0.1:9000", "a&b=c+d%e f", id);
        let (_, query) = transport.url.split_once('?').unwrap();

        let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes()).into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("token".to_string(), "a&b=c+d%e f".to_string()),
                ("client".to_string(), id.as_uuid().to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_send_before_open_is_closed() {
        let id = ContextId::from_seed(4);
        let transport = SocketTransport::new("ws://127.0.0.1:9", "secret", id);
        let env = Envelope::ack(healer_env::MessageId::from_seed(1), id, 0);
        assert!(matches!(transport.send(env).await, Err(EnvError::Closed)));
        assert!(matches!(transport.request_snapshot(), Err(EnvError::Closed)));
    }
}

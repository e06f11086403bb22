//! Relay Hub
//!
//! Owns the relay queue and the table of connected peers behind a single
//! mutex. Connection tasks and the periodic drivers call into the hub; the
//! hub never does I/O itself, it only pushes frames onto each peer's outbound
//! channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use healer_core::{MessageBody, QueueEvent, RelayQueue};
use healer_env::{Envelope, EnvelopeKind, MessageId};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::AdmissionError;
use crate::protocol::Frame;

/// Connection handle assigned by the hub
pub type PeerId = u64;

struct Peer {
    client: String,
    tx: mpsc::UnboundedSender<Frame>,
    last_seen_ms: u64,
}

struct HubState {
    queue: RelayQueue,
    peers: HashMap<PeerId, Peer>,
    /// Latest `state:sync` payload, handed to peers that ask for it
    snapshot: Option<Value>,
    next_peer: PeerId,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    acknowledged: AtomicU64,
    retransmissions: AtomicU64,
    rejected: AtomicU64,
    rate_limited: AtomicU64,
}

/// Monotonic relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub enqueued: u64,
    pub acknowledged: u64,
    pub retransmissions: u64,
    pub rejected: u64,
    pub rate_limited: u64,
}

/// What happened to a `message:send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// New envelope: tracked, fanned out, receipt sent to the sender
    Enqueued { forwarded: usize },
    /// Known id (a client retransmission): fanned out again, not re-stored
    Retransmitted { forwarded: usize },
    /// ACK envelope: fanned out; `matched` if it closed a relay entry
    Ack { matched: bool, forwarded: usize },
}

/// `GET /health` body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub connected_peers: usize,
    pub pending_queue_depth: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerReport {
    pub id: String,
    pub last_seen_ms: u64,
}

/// `GET /metrics` body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    #[serde(flatten)]
    pub health: HealthReport,
    pub peers: Vec<PeerReport>,
    pub pending_ids: Vec<MessageId>,
    pub delivered_ids: Vec<MessageId>,
    pub failed_ids: Vec<MessageId>,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
}

/// Shared relay state.
pub struct RelayHub {
    state: Mutex<HubState>,
    counters: Counters,
    started: Instant,
}

impl RelayHub {
    pub fn new() -> Self {
        RelayHub {
            state: Mutex::new(HubState {
                queue: RelayQueue::new(),
                peers: HashMap::new(),
                snapshot: None,
                next_peer: 1,
            }),
            counters: Counters::default(),
            started: Instant::now(),
        }
    }

    /// Adds a connected peer. Frames for it arrive on the returned receiver.
    pub fn register(&self, client: impl Into<String>, now_ms: u64) -> (PeerId, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        let id = state.next_peer;
        state.next_peer += 1;

        let client = client.into();
        info!(peer = id, client = %client, "peer connected");
        state.peers.insert(
            id,
            Peer {
                client,
                tx,
                last_seen_ms: now_ms,
            },
        );
        (id, rx)
    }

    pub fn unregister(&self, peer: PeerId) -> bool {
        match self.state.lock().unwrap().peers.remove(&peer) {
            Some(p) => {
                info!(peer, client = %p.client, "peer disconnected");
                true
            }
            None => false,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().unwrap().peers.len()
    }

    /// Records activity from a peer.
    pub fn touch(&self, peer: PeerId, now_ms: u64) {
        if let Some(p) = self.state.lock().unwrap().peers.get_mut(&peer) {
            p.last_seen_ms = now_ms;
        }
    }

    /// Queues a frame for one peer.
    pub fn send_to(&self, peer: PeerId, frame: Frame) -> bool {
        match self.state.lock().unwrap().peers.get(&peer) {
            Some(p) => p.tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Handles an admitted `message:send`.
    pub fn submit(&self, from: PeerId, envelope: Envelope, now_ms: u64) -> Result<SubmitOutcome, AdmissionError> {
        let frame = Frame::receive(&envelope).map_err(|e| AdmissionError::InvalidFrame(e.to_string()))?;
        let mut state = self.state.lock().unwrap();

        if envelope.kind == EnvelopeKind::Ack {
            let target = match MessageBody::decode(&envelope) {
                Ok(MessageBody::Ack(ack)) => ack.target_id,
                _ => return Err(AdmissionError::MissingField("payload.targetId")),
            };
            let matched = state.queue.acknowledge(&target, now_ms);
            if matched {
                self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
            }
            let forwarded = fan_out(&state.peers, &frame, Some(from));
            debug!(peer = from, target = %target, matched, forwarded, "ack relayed");
            return Ok(SubmitOutcome::Ack { matched, forwarded });
        }

        let id = envelope.id;
        let fresh = state.queue.enqueue(envelope, now_ms);
        let forwarded = fan_out(&state.peers, &frame, Some(from));
        if let Some(sender) = state.peers.get(&from) {
            if sender.tx.send(Frame::ack(id)).is_err() {
                debug!(peer = from, id = %id, "receipt not delivered, sender is gone");
            }
        }

        if fresh {
            self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            debug!(peer = from, id = %id, forwarded, "enqueued");
            Ok(SubmitOutcome::Enqueued { forwarded })
        } else {
            debug!(peer = from, id = %id, forwarded, "client retransmission forwarded");
            Ok(SubmitOutcome::Retransmitted { forwarded })
        }
    }

    /// A client acknowledged a relay-held id.
    pub fn client_ack(&self, from: PeerId, id: &MessageId, now_ms: u64) -> bool {
        let matched = self.state.lock().unwrap().queue.acknowledge(id, now_ms);
        if matched {
            self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
            debug!(peer = from, id = %id, "acknowledged by client");
        }
        matched
    }

    /// Stores a snapshot and forwards it to every other peer.
    pub fn store_snapshot(&self, from: PeerId, snapshot: Value) -> usize {
        let mut state = self.state.lock().unwrap();
        let frame = Frame::state_sync(snapshot.clone());
        state.snapshot = Some(snapshot);
        fan_out(&state.peers, &frame, Some(from))
    }

    /// Sends the stored snapshot to `peer`, if there is one.
    pub fn request_snapshot(&self, peer: PeerId) -> bool {
        let state = self.state.lock().unwrap();
        match (&state.snapshot, state.peers.get(&peer)) {
            (Some(snapshot), Some(p)) => p.tx.send(Frame::state_sync(snapshot.clone())).is_ok(),
            _ => false,
        }
    }

    /// Retry driver: rebroadcasts every due entry to all connected peers.
    pub fn retry_tick(&self, ack_timeout_ms: u64, now_ms: u64) -> usize {
        let mut state = self.state.lock().unwrap();
        let due = state.queue.pending_due_for_retry(ack_timeout_ms, now_ms);

        let mut sent = 0;
        for envelope in due {
            let Some(next) = state.queue.record_retransmission(&envelope.id, now_ms) else {
                continue;
            };
            match Frame::receive(&next) {
                Ok(frame) => {
                    fan_out(&state.peers, &frame, None);
                    sent += 1;
                }
                Err(e) => warn!(id = %next.id, "failed to encode retransmission: {}", e),
            }
        }

        if sent > 0 {
            self.counters.retransmissions.fetch_add(sent as u64, Ordering::Relaxed);
            debug!(sent, "relay retransmitted");
        }
        sent
    }

    /// Cleanup driver: purges delivered entries older than `ttl_ms`.
    pub fn cleanup_tick(&self, ttl_ms: u64, now_ms: u64) -> usize {
        let removed = self.state.lock().unwrap().queue.cleanup(ttl_ms, now_ms);
        if removed > 0 {
            info!("Cleaned up {} delivered entries", removed);
        }
        removed
    }

    pub fn record_rejected(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Observer channel for queue lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.state.lock().unwrap().queue.subscribe()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().queue.pending_len()
    }

    pub fn delivered_len(&self) -> usize {
        self.state.lock().unwrap().queue.delivered_len()
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            acknowledged: self.counters.acknowledged.load(Ordering::Relaxed),
            retransmissions: self.counters.retransmissions.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
        }
    }

    pub fn health(&self) -> HealthReport {
        let state = self.state.lock().unwrap();
        self.health_locked(&state)
    }

    pub fn metrics(&self) -> MetricsReport {
        let state = self.state.lock().unwrap();
        let mut peers: Vec<PeerReport> = state
            .peers
            .iter()
            .map(|(id, p)| PeerReport {
                id: format!("{}#{}", p.client, id),
                last_seen_ms: p.last_seen_ms,
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));

        MetricsReport {
            health: self.health_locked(&state),
            peers,
            pending_ids: state.queue.queue_ids(),
            delivered_ids: state.queue.delivered_ids(),
            failed_ids: state.queue.failed_ids(),
            counters: self.counters(),
        }
    }

    fn health_locked(&self, state: &HubState) -> HealthReport {
        HealthReport {
            status: "healthy",
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: self.started.elapsed().as_secs(),
            connected_peers: state.peers.len(),
            pending_queue_depth: state.queue.pending_len(),
        }
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

fn fan_out(peers: &HashMap<PeerId, Peer>, frame: &Frame, except: Option<PeerId>) -> usize {
    peers
        .iter()
        .filter(|(id, _)| Some(**id) != except)
        .filter(|(_, p)| p.tx.send(frame.clone()).is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MESSAGE_ACK, MESSAGE_RECEIVE, STATE_SYNC};
    use healer_env::ContextId;
    use serde_json::json;

    fn change(origin: u64, limit: u32) -> Envelope {
        Envelope::new(
            EnvelopeKind::StateChange,
            json!({ "entityId": "n1", "newState": "emergency" }),
            ContextId::from_seed(origin),
            limit,
            0,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_submit_survives_departed_sender() {
        let hub = RelayHub::new();
        let (a, rx_a) = hub.register("a", 0);
        let (_b, mut rx_b) = hub.register("b", 0);
        drop(rx_a);

        let outcome = hub.submit(a, change(1, 5), 0).unwrap();
        assert_eq!(outcome, SubmitOutcome::Enqueued { forwarded: 1 });
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn test_saturated_attempt_count_fails_without_poisoning() {
        let hub = RelayHub::new();
        let (a, _rx_a) = hub.register("a", 0);

        let mut env = change(1, 5);
        env.attempt_count = u32::MAX;
        hub.submit(a, env, 0).unwrap();

        assert_eq!(hub.retry_tick(300, 1_000), 0);
        assert_eq!(hub.pending_len(), 0);
        assert_eq!(hub.metrics().failed_ids.len(), 1);
        assert_eq!(hub.health().connected_peers, 1);
    }

    #[test]
    fn test_submit_fans_out_and_confirms() {
        let hub = RelayHub::new();
        let (a, mut rx_a) = hub.register("a", 0);
        let (_b, mut rx_b) = hub.register("b", 0);
        let (_c, mut rx_c) = hub.register("c", 0);

        let env = change(1, 5);
        let outcome = hub.submit(a, env.clone(), 10).unwrap();
        assert_eq!(outcome, SubmitOutcome::Enqueued { forwarded: 2 });

        let to_a = drain(&mut rx_a);
        assert_eq!(to_a, vec![Frame::ack(env.id)]);
        for rx in [&mut rx_b, &mut rx_c] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].event, MESSAGE_RECEIVE);
        }
        assert_eq!(hub.pending_len(), 1);
        assert_eq!(hub.counters().enqueued, 1);
    }

    #[test]
    fn test_client_retransmission_is_forwarded_not_stored() {
        let hub = RelayHub::new();
        let (a, _rx_a) = hub.register("a", 0);
        let (_b, mut rx_b) = hub.register("b", 0);

        let env = change(1, 5);
        hub.submit(a, env.clone(), 0).unwrap();
        let outcome = hub.submit(a, env.next_attempt(), 300).unwrap();
        assert_eq!(outcome, SubmitOutcome::Retransmitted { forwarded: 1 });
        assert_eq!(drain(&mut rx_b).len(), 2);
        assert_eq!(hub.pending_len(), 1);
        assert_eq!(hub.counters().enqueued, 1);
    }

    #[test]
    fn test_ack_envelope_closes_entry_and_reaches_origin() {
        let hub = RelayHub::new();
        let (a, mut rx_a) = hub.register("a", 0);
        let (b, _rx_b) = hub.register("b", 0);

        let env = change(1, 5);
        hub.submit(a, env.clone(), 0).unwrap();
        drain(&mut rx_a);

        let ack = Envelope::ack(env.id, ContextId::from_seed(2), 5);
        let outcome = hub.submit(b, ack, 5).unwrap();
        assert_eq!(outcome, SubmitOutcome::Ack { matched: true, forwarded: 1 });
        assert_eq!(hub.pending_len(), 0);
        assert_eq!(hub.delivered_len(), 1);

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        let relayed: Envelope = serde_json::from_value(frames[0].data.clone()).unwrap();
        assert_eq!(relayed.kind, EnvelopeKind::Ack);
    }

    #[test]
    fn test_malformed_ack_is_refused() {
        let hub = RelayHub::new();
        let (a, _rx) = hub.register("a", 0);
        let bogus = Envelope::new(EnvelopeKind::Ack, json!({}), ContextId::from_seed(1), 1, 0);
        assert!(hub.submit(a, bogus, 0).is_err());
    }

    #[test]
    fn test_retry_reaches_everyone_until_failed() {
        let hub = RelayHub::new();
        let (a, mut rx_a) = hub.register("a", 0);
        let (_b, mut rx_b) = hub.register("b", 0);

        hub.submit(a, change(1, 3), 0).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        // Not yet due
        assert_eq!(hub.retry_tick(300, 100), 0);

        assert_eq!(hub.retry_tick(300, 300), 1);
        assert_eq!(drain(&mut rx_a).len(), 1, "retries include the originator");
        assert_eq!(drain(&mut rx_b).len(), 1);

        assert_eq!(hub.retry_tick(300, 600), 1);
        // Three transmissions spent: the entry fails instead of retrying
        assert_eq!(hub.retry_tick(300, 900), 0);
        assert_eq!(hub.pending_len(), 0);
        assert_eq!(hub.metrics().failed_ids.len(), 1);
        assert_eq!(hub.counters().retransmissions, 2);
    }

    #[test]
    fn test_client_ack_and_cleanup() {
        let hub = RelayHub::new();
        let (a, _rx) = hub.register("a", 0);
        let env = change(1, 5);
        hub.submit(a, env.clone(), 0).unwrap();

        assert!(hub.client_ack(a, &env.id, 50));
        assert!(!hub.client_ack(a, &env.id, 60));
        assert_eq!(hub.cleanup_tick(1_000, 500), 0);
        assert_eq!(hub.cleanup_tick(1_000, 1_050), 1);
        assert_eq!(hub.delivered_len(), 0);
    }

    #[test]
    fn test_snapshot_store_and_request() {
        let hub = RelayHub::new();
        let (a, _rx_a) = hub.register("a", 0);
        let (b, mut rx_b) = hub.register("b", 0);

        assert!(!hub.request_snapshot(b));
        assert_eq!(hub.store_snapshot(a, json!({ "entities": [] })), 1);
        assert_eq!(drain(&mut rx_b)[0].event, STATE_SYNC);

        assert!(hub.request_snapshot(b));
        let frames = drain(&mut rx_b);
        assert_eq!(frames, vec![Frame::state_sync(json!({ "entities": [] }))]);
    }

    #[test]
    fn test_reports() {
        let hub = RelayHub::new();
        let (a, _rx) = hub.register("alpha", 42);
        hub.submit(a, change(1, 5), 0).unwrap();
        hub.touch(a, 99);

        let health = hub.health();
        assert_eq!(health.connected_peers, 1);
        assert_eq!(health.pending_queue_depth, 1);

        let metrics = hub.metrics();
        assert_eq!(metrics.peers[0].last_seen_ms, 99);
        assert!(metrics.peers[0].id.starts_with("alpha#"));
        assert_eq!(metrics.pending_ids.len(), 1);

        let value = serde_json::to_value(&metrics).unwrap();
        assert_eq!(value["connectedPeers"], 1);
        assert_eq!(value["enqueued"], 1);
        assert!(value["pendingIds"].is_array());

        assert!(hub.unregister(a));
        assert!(!hub.unregister(a));
        assert_eq!(hub.peer_count(), 0);
    }

    #[test]
    fn test_ack_frame_event() {
        assert_eq!(Frame::ack(MessageId::from_seed(1)).event, MESSAGE_ACK);
    }
}

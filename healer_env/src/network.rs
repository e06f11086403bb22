//! Transport abstraction for Healer contexts.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EnvError;
use crate::types::{ContextId, Envelope, MessageId};

/// A live registration for inbound envelopes.
///
/// Every physically delivered envelope is yielded once, including envelopes
/// this context sent itself; filtering self-origin is the core's job.
/// Dropping the subscription releases it.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    /// Creates a subscription and the sender that feeds it.
    pub fn channel() -> (mpsc::UnboundedSender<Envelope>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Waits for the next envelope. `None` once the transport has closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Takes an already-delivered envelope without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Drains everything currently buffered.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(envelope) = self.try_recv() {
            out.push(envelope);
        }
        out
    }
}

/// Abstraction for envelope I/O between contexts.
///
/// # Implementations
///
/// - **Local**: `LocalBroadcast`, an in-process bus shared by all contexts
/// - **Relayed**: `healer_relay::SocketTransport`, a WebSocket to the relay
/// - **Simulation**: `healer_sim::SimNetwork`, routed with latency/loss
///
/// # Packet Flow
///
/// ```text
/// Context A                  Transport                  Context B
///   |                           |                          |
///   |-- send(envelope) -------->|                          |
///   |<-- echo ------------------|-- [latency/loss] ------->|
///   |                           |                          |-- subscription yields
/// ```
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Emits an envelope to every peer.
    ///
    /// Best-effort: `Ok(())` means the envelope was handed off, not that
    /// anyone received it. `Err(EnvError::Dropped)` reports a deliberate
    /// fault-injection drop.
    async fn send(&self, envelope: Envelope) -> Result<(), EnvError>;

    /// Registers for inbound envelopes (the `onReceive` hook).
    fn subscribe(&self) -> Result<Subscription, EnvError>;

    /// Builds and sends an acknowledgment for `target_id` on behalf of
    /// `origin_id`.
    async fn send_ack(&self, target_id: MessageId, origin_id: ContextId) -> Result<(), EnvError> {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.send(Envelope::ack(target_id, origin_id, now_ms)).await
    }

    /// Establishes the underlying channel. Idempotent.
    async fn open(&self) -> Result<(), EnvError> {
        Ok(())
    }

    /// Tears the channel down and releases every subscription.
    async fn close(&self);

    /// Returns this context's ID.
    fn local_id(&self) -> ContextId;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnvelopeKind;

    #[tokio::test]
    async fn test_subscription_yields_in_order() {
        let (tx, mut sub) = Subscription::channel();
        let origin = ContextId::from_seed(1);

        for i in 0..3u64 {
            let env = Envelope::new(EnvelopeKind::StateSync, serde_json::json!(i), origin, 1, i);
            tx.send(env).unwrap();
        }

        let drained = sub.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[2].created_at_ms, 2);
        assert!(sub.try_recv().is_none());

        drop(tx);
        assert!(sub.recv().await.is_none());
    }
}

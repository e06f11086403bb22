//! In-process broadcast transport.
//!
//! Models a same-process broadcast primitive: every envelope sent on the bus
//! reaches every live subscription, the sender's own included.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::EnvError;
use crate::network::{Subscription, Transport};
use crate::types::{ContextId, Envelope};

/// Shared bus that all local contexts attach to.
#[derive(Default)]
pub struct BroadcastBus {
    /// Live subscriptions, tagged with the owning context
    subscribers: Mutex<Vec<(ContextId, mpsc::UnboundedSender<Envelope>)>>,
}

impl BroadcastBus {
    /// Creates an empty bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates the transport endpoint for one context.
    pub fn endpoint(self: &Arc<Self>, local_id: ContextId) -> LocalBroadcast {
        LocalBroadcast {
            bus: Arc::clone(self),
            local_id,
            open: AtomicBool::new(true),
        }
    }

    /// Delivers an envelope to every live subscription.
    ///
    /// Returns the number of subscriptions reached.
    pub fn publish(&self, envelope: &Envelope) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|(_, tx)| !tx.is_closed());

        let mut delivered = 0;
        for (_, tx) in subscribers.iter() {
            if tx.send(envelope.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|(_, tx)| !tx.is_closed());
        subscribers.len()
    }

    fn register(&self, owner: ContextId, tx: mpsc::UnboundedSender<Envelope>) {
        self.subscribers.lock().unwrap().push((owner, tx));
    }

    fn release(&self, owner: ContextId) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != owner);
        before - subscribers.len()
    }
}

/// One context's handle on a `BroadcastBus`.
pub struct LocalBroadcast {
    bus: Arc<BroadcastBus>,
    local_id: ContextId,
    open: AtomicBool,
}

impl LocalBroadcast {
    /// True until `close()` is called (and again after `open()`).
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for LocalBroadcast {
    async fn send(&self, envelope: Envelope) -> Result<(), EnvError> {
        if !self.is_open() {
            return Err(EnvError::Closed);
        }
        self.bus.publish(&envelope);
        Ok(())
    }

    fn subscribe(&self) -> Result<Subscription, EnvError> {
        if !self.is_open() {
            return Err(EnvError::Closed);
        }
        let (tx, subscription) = Subscription::channel();
        self.bus.register(self.local_id, tx);
        Ok(subscription)
    }

    async fn open(&self) -> Result<(), EnvError> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
        let released = self.bus.release(self.local_id);
        debug!(context = %self.local_id, released, "local broadcast closed");
    }

    fn local_id(&self) -> ContextId {
        self.local_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnvelopeKind;

    fn envelope(origin: ContextId) -> Envelope {
        Envelope::new(EnvelopeKind::StateChange, serde_json::json!({}), origin, 5, 0)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_including_sender() {
        let bus = BroadcastBus::new();
        let a = bus.endpoint(ContextId::from_seed(1));
        let b = bus.endpoint(ContextId::from_seed(2));

        let mut sub_a = a.subscribe().unwrap();
        let mut sub_b = b.subscribe().unwrap();

        let env = envelope(a.local_id());
        a.send(env.clone()).await.unwrap();

        assert_eq!(sub_a.try_recv(), Some(env.clone()));
        assert_eq!(sub_b.try_recv(), Some(env));
    }

    #[tokio::test]
    async fn test_close_releases_subscription() {
        let bus = BroadcastBus::new();
        let a = bus.endpoint(ContextId::from_seed(1));
        let b = bus.endpoint(ContextId::from_seed(2));

        let mut sub_a = a.subscribe().unwrap();
        let _sub_b = b.subscribe().unwrap();
        assert_eq!(bus.subscriber_count(), 2);

        a.close().await;
        assert_eq!(bus.subscriber_count(), 1);
        assert!(sub_a.recv().await.is_none());

        let err = a.send(envelope(a.local_id())).await.unwrap_err();
        assert!(matches!(err, EnvError::Closed));
        assert!(a.subscribe().is_err());

        a.open().await.unwrap();
        assert!(a.send(envelope(a.local_id())).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus = BroadcastBus::new();
        let a = bus.endpoint(ContextId::from_seed(1));

        let sub = a.subscribe().unwrap();
        drop(sub);

        assert_eq!(bus.publish(&envelope(a.local_id())), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}

//! Simulated broadcast transport with per-link fault injection.
//!
//! Every `SimNetwork` endpoint posts outgoing envelopes to the world's
//! central router; the router fans them out (echo to the sender included)
//! after consulting the `SimNetworkController`. Link faults are judged here,
//! independently of any chaos a client applies on its own send path.

use async_trait::async_trait;
use healer_core::{decide_with, ChaosConfig, ChaosDecision};
use healer_env::{ContextId, EnvError, Envelope, Subscription, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Internal message to the network router.
#[derive(Debug)]
pub struct NetworkMessage {
    pub from: ContextId,
    pub envelope: Envelope,
}

/// Simulated network interface for one peer.
pub struct SimNetwork {
    /// This peer's ID
    local_id: ContextId,

    /// Sender to central router
    tx: mpsc::UnboundedSender<NetworkMessage>,

    /// Delivery side of the current subscription, if any
    inbox: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,

    open: AtomicBool,
}

impl SimNetwork {
    /// Creates a new simulated network interface.
    pub fn new(local_id: ContextId, tx: mpsc::UnboundedSender<NetworkMessage>) -> Self {
        Self {
            local_id,
            tx,
            inbox: Mutex::new(None),
            open: AtomicBool::new(true),
        }
    }

    /// Hands an envelope to the subscriber. Returns `false` when nobody is
    /// listening (closed, or never subscribed).
    pub fn deliver(&self, envelope: Envelope) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        match self.inbox.lock().unwrap().as_ref() {
            Some(inbox) => inbox.send(envelope).is_ok(),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SimNetwork {
    async fn send(&self, envelope: Envelope) -> Result<(), EnvError> {
        if !self.is_open() {
            return Err(EnvError::Closed);
        }
        let msg = NetworkMessage {
            from: self.local_id,
            envelope,
        };
        self.tx.send(msg).map_err(|_| EnvError::network("Router gone"))
    }

    fn subscribe(&self) -> Result<Subscription, EnvError> {
        if !self.is_open() {
            return Err(EnvError::Closed);
        }
        let (tx, subscription) = Subscription::channel();
        *self.inbox.lock().unwrap() = Some(tx);
        Ok(subscription)
    }

    async fn open(&self) -> Result<(), EnvError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.inbox.lock().unwrap().take();
    }

    fn local_id(&self) -> ContextId {
        self.local_id
    }
}

/// Verdict for one envelope on one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkVerdict {
    Deliver,
    Delay(u64),
    Lost,
    Partitioned,
}

/// Network controller for fault injection.
pub struct SimNetworkController {
    /// Chaos applied to links without an explicit override
    default_link: Mutex<ChaosConfig>,

    /// Per-link overrides (directional)
    links: Mutex<HashMap<(ContextId, ContextId), ChaosConfig>>,

    /// Active partitions (peers that cannot communicate)
    partitions: Mutex<Vec<(Vec<ContextId>, Vec<ContextId>)>>,
}

impl SimNetworkController {
    /// Creates a controller with perfect links.
    pub fn new() -> Self {
        Self {
            default_link: Mutex::new(ChaosConfig::disabled()),
            links: Mutex::new(HashMap::new()),
            partitions: Mutex::new(Vec::new()),
        }
    }

    /// Sets the chaos applied to every link without an override.
    pub fn set_default(&self, config: ChaosConfig) {
        *self.default_link.lock().unwrap() = config;
    }

    /// Overrides chaos for one direction of one link.
    pub fn set_link(&self, from: ContextId, to: ContextId, config: ChaosConfig) {
        self.links.lock().unwrap().insert((from, to), config);
    }

    /// Sets packet loss rate for a link, keeping its latency.
    pub fn set_loss(&self, from: ContextId, to: ContextId, loss_rate: f64) {
        let mut config = self.link(from, to);
        config.drop_probability = loss_rate.clamp(0.0, 1.0);
        self.set_link(from, to, config);
    }

    /// Effective chaos for a link.
    pub fn link(&self, from: ContextId, to: ContextId) -> ChaosConfig {
        self.links
            .lock()
            .unwrap()
            .get(&(from, to))
            .copied()
            .unwrap_or_else(|| *self.default_link.lock().unwrap())
    }

    /// Creates a network partition between two groups.
    pub fn partition(&self, group_a: Vec<ContextId>, group_b: Vec<ContextId>) {
        self.partitions.lock().unwrap().push((group_a, group_b));
    }

    /// Heals all active partitions.
    pub fn heal_all(&self) {
        self.partitions.lock().unwrap().clear();
    }

    /// Checks if two peers can communicate (not partitioned).
    pub fn can_communicate(&self, from: ContextId, to: ContextId) -> bool {
        let partitions = self.partitions.lock().unwrap();

        for (group_a, group_b) in partitions.iter() {
            let from_in_a = group_a.contains(&from);
            let from_in_b = group_b.contains(&from);
            let to_in_a = group_a.contains(&to);
            let to_in_b = group_b.contains(&to);

            // Partitioned if one is in A and other in B (or vice versa)
            if (from_in_a && to_in_b) || (from_in_b && to_in_a) {
                return false;
            }
        }

        true
    }

    /// Judges one envelope on one link from two uniform rolls.
    pub fn judge(&self, from: ContextId, to: ContextId, drop_roll: f64, latency_roll: f64) -> LinkVerdict {
        if !self.can_communicate(from, to) {
            return LinkVerdict::Partitioned;
        }
        match decide_with(&self.link(from, to), drop_roll, latency_roll) {
            ChaosDecision::Deliver => LinkVerdict::Deliver,
            ChaosDecision::Drop => LinkVerdict::Lost,
            ChaosDecision::Delay(d) => LinkVerdict::Delay(d.as_millis() as u64),
        }
    }
}

impl Default for SimNetworkController {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience for tests: an endpoint wired to a fresh router.
pub fn endpoint(local_id: ContextId) -> (Arc<SimNetwork>, mpsc::UnboundedReceiver<NetworkMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(SimNetwork::new(local_id, tx)), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use healer_env::EnvelopeKind;

    #[test]
    fn test_network_controller_partition() {
        let controller = SimNetworkController::new();

        let a = ContextId::from_seed(1);
        let b = ContextId::from_seed(2);
        let c = ContextId::from_seed(3);

        // Initially all can communicate
        assert!(controller.can_communicate(a, b));
        assert!(controller.can_communicate(a, c));
        assert!(controller.can_communicate(b, c));

        // Partition: {a} vs {b, c}
        controller.partition(vec![a], vec![b, c]);

        // Now a cannot talk to b or c
        assert!(!controller.can_communicate(a, b));
        assert!(!controller.can_communicate(a, c));
        assert_eq!(controller.judge(a, b, 0.9, 0.0), LinkVerdict::Partitioned);

        // But b and c can still talk
        assert!(controller.can_communicate(b, c));

        // Heal
        controller.heal_all();
        assert!(controller.can_communicate(a, b));
    }

    #[test]
    fn test_network_controller_links_are_directional() {
        let controller = SimNetworkController::new();

        let a = ContextId::from_seed(1);
        let b = ContextId::from_seed(2);

        controller.set_link(a, b, ChaosConfig::disabled().with_latency(100, 100));
        assert_eq!(controller.judge(a, b, 0.5, 0.5), LinkVerdict::Delay(100));

        // Reverse direction is separate
        assert_eq!(controller.judge(b, a, 0.5, 0.5), LinkVerdict::Deliver);

        controller.set_loss(a, b, 1.0);
        assert_eq!(controller.judge(a, b, 0.999, 0.5), LinkVerdict::Lost);
        assert_eq!(controller.link(a, b).max_latency_ms, 100);
    }

    #[test]
    fn test_default_link_applies_everywhere() {
        let controller = SimNetworkController::new();
        controller.set_default(ChaosConfig::lossy(1.0));
        let (a, b) = (ContextId::from_seed(1), ContextId::from_seed(2));
        assert_eq!(controller.judge(a, b, 0.3, 0.3), LinkVerdict::Lost);
        assert_eq!(controller.judge(b, a, 0.3, 0.3), LinkVerdict::Lost);
    }

    #[tokio::test]
    async fn test_sim_network_posts_to_router() {
        let id = ContextId::from_seed(7);
        let (net, mut router) = endpoint(id);
        let mut sub = net.subscribe().unwrap();

        let env = Envelope::new(EnvelopeKind::StateSync, serde_json::json!({ "entities": [] }), id, 1, 0);
        net.send(env.clone()).await.unwrap();

        let msg = router.try_recv().unwrap();
        assert_eq!(msg.from, id);
        assert!(net.deliver(msg.envelope));
        assert_eq!(sub.try_recv(), Some(env.clone()));

        net.close().await;
        assert!(!net.deliver(env.clone()));
        assert!(matches!(net.send(env).await, Err(EnvError::Closed)));
    }
}

//! SimWorld - The simulation harness container.
//!
//! Owns the virtual clock, the router and every simulated peer. Time only
//! moves through [`SimWorld::advance`]; the periodic drivers of each
//! messenger are invoked by hand, so a run is a pure function of its seed.

use crate::context::SimContext;
use crate::network::{LinkVerdict, NetworkMessage, SimNetwork, SimNetworkController};

use healer_core::{Entity, HealerError, MessengerConfig, Position, ReliableMessenger};
use healer_env::{ContextId, Envelope, EnvelopeKind, HealerContext, Subscription, Transport};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Upper bound on route/pump rounds in one settle pass
const MAX_SETTLE_ROUNDS: usize = 64;

pub type SimMessenger = ReliableMessenger<SimContext, SimNetwork>;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of peers to spawn
    pub num_peers: usize,

    /// Messenger settings shared by every peer
    pub messenger: MessengerConfig,

    /// Entities every peer starts with
    pub entities: Vec<Entity>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_peers: 3,
            messenger: MessengerConfig::default(),
            entities: default_entities(5),
        }
    }
}

/// `n1..=nN` laid out on a line, all normal.
pub fn default_entities(count: usize) -> Vec<Entity> {
    (1..=count)
        .map(|i| {
            Entity::new(
                format!("n{}", i),
                format!("Node {}", i),
                Position::new(i as f64 * 120.0, 80.0),
            )
        })
        .collect()
}

/// Router counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    /// Envelopes posted by peers
    pub posted: u64,
    /// Copies handed to a peer's inbox
    pub delivered: u64,
    /// Copies lost to link chaos
    pub lost: u64,
    /// Copies blocked by a partition
    pub partitioned: u64,
    /// Copies held back by link latency
    pub delayed: u64,
    /// ACK envelopes posted
    pub acks_posted: u64,
}

/// A simulated context: its messenger plus the inbox it drains.
pub struct SimPeer {
    pub id: ContextId,
    pub network: Arc<SimNetwork>,
    pub messenger: SimMessenger,
    inbox: Subscription,
}

impl SimPeer {
    /// Feeds every queued envelope through the messenger. Returns how many
    /// were processed.
    pub async fn pump(&mut self) -> usize {
        let mut processed = 0;
        while let Some(envelope) = self.inbox.try_recv() {
            self.messenger.handle_incoming(envelope).await;
            processed += 1;
        }
        processed
    }
}

struct InFlight {
    deliver_at_ms: u64,
    seq: u64,
    to: ContextId,
    envelope: Envelope,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock + RNG)
    pub context: Arc<SimContext>,

    /// Network controller for fault injection
    pub network_controller: SimNetworkController,

    /// Peers in spawn order
    peers: Vec<SimPeer>,

    /// Central router sender (cloned into every endpoint)
    router_tx: mpsc::UnboundedSender<NetworkMessage>,

    /// Central router receiver
    router_rx: mpsc::UnboundedReceiver<NetworkMessage>,

    /// Copies waiting out their link latency
    in_flight: Vec<InFlight>,

    next_seq: u64,
    next_cleanup_ms: u64,
    ticks: u64,
    stats: NetworkStats,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Self {
        let context = SimContext::shared(config.seed);
        let (router_tx, router_rx) = mpsc::unbounded_channel::<NetworkMessage>();
        let next_cleanup_ms = config.messenger.cleanup_interval_ms;

        Self {
            config,
            context,
            network_controller: SimNetworkController::new(),
            peers: Vec::new(),
            router_tx,
            router_rx,
            in_flight: Vec::new(),
            next_seq: 0,
            next_cleanup_ms,
            ticks: 0,
            stats: NetworkStats::default(),
        }
    }

    /// Spawns the configured number of peers and returns their IDs.
    pub fn spawn_peers(&mut self) -> Result<Vec<ContextId>, HealerError> {
        let entities = self.config.entities.clone();
        (0..self.config.num_peers)
            .map(|_| self.add_peer(entities.clone()))
            .collect()
    }

    /// Adds one peer with its own starting entities (a late joiner can start
    /// empty).
    pub fn add_peer(&mut self, entities: Vec<Entity>) -> Result<ContextId, HealerError> {
        let index = self.peers.len() as u64;
        let id = ContextId::from_seed(self.config.seed.wrapping_mul(1_000).wrapping_add(index));
        let network = Arc::new(SimNetwork::new(id, self.router_tx.clone()));
        let inbox = network.subscribe()?;

        let config = self
            .config
            .messenger
            .clone()
            .with_name(format!("sim-peer-{}", index));
        let messenger =
            ReliableMessenger::new(Arc::clone(&self.context), Arc::clone(&network), config)?.with_entities(entities);

        debug!(peer = %id, index, "peer spawned");
        self.peers.push(SimPeer {
            id,
            network,
            messenger,
            inbox,
        });
        Ok(id)
    }

    pub fn peer(&self, index: usize) -> &SimPeer {
        &self.peers[index]
    }

    pub fn peer_mut(&mut self, index: usize) -> &mut SimPeer {
        &mut self.peers[index]
    }

    pub fn peers(&self) -> &[SimPeer] {
        &self.peers
    }

    pub fn peer_ids(&self) -> Vec<ContextId> {
        self.peers.iter().map(|p| p.id).collect()
    }

    /// Drains the router, fanning each envelope out to every peer.
    ///
    /// The sender gets its own copy back unconditionally, the way a broadcast
    /// channel echoes; every other copy is judged on its link.
    pub fn route(&mut self) -> usize {
        let mut routed = 0;
        while let Ok(msg) = self.router_rx.try_recv() {
            routed += 1;
            self.stats.posted += 1;
            if msg.envelope.kind == EnvelopeKind::Ack {
                self.stats.acks_posted += 1;
            }

            for peer in &self.peers {
                if peer.id == msg.from {
                    if peer.network.deliver(msg.envelope.clone()) {
                        self.stats.delivered += 1;
                    }
                    continue;
                }

                let drop_roll = self.context.random_f64();
                let latency_roll = self.context.random_f64();
                match self
                    .network_controller
                    .judge(msg.from, peer.id, drop_roll, latency_roll)
                {
                    LinkVerdict::Deliver => {
                        if peer.network.deliver(msg.envelope.clone()) {
                            self.stats.delivered += 1;
                        }
                    }
                    LinkVerdict::Delay(ms) => {
                        self.stats.delayed += 1;
                        self.in_flight.push(InFlight {
                            deliver_at_ms: self.context.elapsed_ms() + ms,
                            seq: self.next_seq,
                            to: peer.id,
                            envelope: msg.envelope.clone(),
                        });
                        self.next_seq += 1;
                    }
                    LinkVerdict::Lost => {
                        trace!(id = %msg.envelope.id, to = %peer.id, "lost on link");
                        self.stats.lost += 1;
                    }
                    LinkVerdict::Partitioned => {
                        trace!(id = %msg.envelope.id, to = %peer.id, "partitioned");
                        self.stats.partitioned += 1;
                    }
                }
            }
        }
        routed
    }

    /// Releases delayed copies whose time has come, oldest first.
    pub fn deliver_due(&mut self) -> usize {
        let now = self.context.elapsed_ms();
        let (mut due, waiting): (Vec<InFlight>, Vec<InFlight>) =
            self.in_flight.drain(..).partition(|f| f.deliver_at_ms <= now);
        self.in_flight = waiting;
        due.sort_by_key(|f| (f.deliver_at_ms, f.seq));

        let mut delivered = 0;
        for flight in due {
            if let Some(peer) = self.peers.iter().find(|p| p.id == flight.to) {
                if peer.network.deliver(flight.envelope) {
                    self.stats.delivered += 1;
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Routes and processes until nothing moves.
    pub async fn settle(&mut self) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let mut moved = self.route() + self.deliver_due();
            for peer in self.peers.iter_mut() {
                moved += peer.pump().await;
            }
            if moved == 0 {
                return;
            }
        }
        debug!("settle round limit reached");
    }

    /// Moves the clock forward and runs whatever is due: delayed copies,
    /// one retry pass per peer, and a cleanup pass when its period elapses.
    pub async fn advance(&mut self, ms: u64) {
        self.context.advance_ms(ms);
        self.ticks += 1;
        self.settle().await;

        for peer in self.peers.iter_mut() {
            peer.messenger.retry_tick().await;
        }
        self.settle().await;

        if self.context.elapsed_ms() >= self.next_cleanup_ms {
            for peer in self.peers.iter_mut() {
                peer.messenger.cleanup_tick();
            }
            self.next_cleanup_ms = self.context.elapsed_ms() + self.config.messenger.cleanup_interval_ms;
        }
    }

    /// One retry period.
    pub async fn tick(&mut self) {
        let period = self.config.messenger.retry_interval_ms;
        self.advance(period).await;
    }

    /// Ticks until `duration_ms` of virtual time has passed.
    pub async fn run_for(&mut self, duration_ms: u64) {
        let end = self.context.elapsed_ms() + duration_ms;
        while self.context.elapsed_ms() < end {
            self.tick().await;
        }
    }

    /// Pushes an envelope straight into a peer's inbox, bypassing the router
    /// (a relay retransmission, as seen by that peer).
    pub fn inject(&mut self, index: usize, envelope: Envelope) -> bool {
        self.peers[index].network.deliver(envelope)
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    /// Milliseconds of virtual time since the run started.
    pub fn elapsed_ms(&self) -> u64 {
        self.context.elapsed_ms()
    }

    /// Number of `advance` steps taken.
    pub fn tick_count(&self) -> u64 {
        self.ticks
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use healer_core::{ChaosConfig, NodeState};

    fn world(num_peers: usize) -> SimWorld {
        let mut world = SimWorld::new(SimConfig {
            seed: 7,
            num_peers,
            ..Default::default()
        });
        world.spawn_peers().unwrap();
        world
    }

    #[test]
    fn test_sim_world_creation() {
        let world = world(3);
        assert_eq!(world.peer_count(), 3);
        assert_eq!(world.elapsed_ms(), 0);
        assert_eq!(world.peer(0).messenger.entities().len(), 5);
    }

    #[test]
    fn test_peer_ids_are_deterministic() {
        assert_eq!(world(3).peer_ids(), world(3).peer_ids());
    }

    #[tokio::test]
    async fn test_broadcast_echoes_to_sender() {
        let mut world = world(2);
        world
            .peer_mut(0)
            .messenger
            .change_state("n1", NodeState::Warning)
            .await
            .unwrap();
        world.settle().await;

        // change + echo, then one ACK + its echo
        assert_eq!(world.stats().posted, 2);
        assert_eq!(world.stats().acks_posted, 1);
        assert_eq!(world.stats().delivered, 4);
        assert_eq!(world.peer(1).messenger.entity("n1").unwrap().state, NodeState::Warning);
        assert_eq!(world.peer(0).messenger.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_link_latency_holds_copies() {
        let mut world = world(2);
        world
            .network_controller
            .set_default(ChaosConfig::disabled().with_latency(100, 100));

        world
            .peer_mut(0)
            .messenger
            .change_state("n1", NodeState::Emergency)
            .await
            .unwrap();
        world.settle().await;
        assert_eq!(world.peer(1).messenger.entity("n1").unwrap().state, NodeState::Normal);

        world.context.advance_ms(100);
        world.settle().await;
        assert_eq!(world.peer(1).messenger.entity("n1").unwrap().state, NodeState::Emergency);
    }
}

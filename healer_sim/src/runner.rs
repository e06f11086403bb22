//! Scenario runner - executes delivery scenarios against a SimWorld.

use crate::scenarios::ScenarioId;
use crate::world::{NetworkStats, SimConfig, SimWorld};

use healer_core::{ChaosConfig, HealerError, MessengerConfig, NodeState};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

/// Why a scenario did not pass
#[derive(Debug, Error)]
pub enum SimError {
    #[error("{0}")]
    Assertion(String),

    #[error("setup failed: {0}")]
    Setup(#[from] HealerError),

    #[error("runtime unavailable: {0}")]
    Runtime(String),
}

fn ensure(condition: bool, reason: impl FnOnce() -> String) -> Result<(), SimError> {
    if condition {
        Ok(())
    } else {
        Err(SimError::Assertion(reason()))
    }
}

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final virtual time in milliseconds
    pub final_time_ms: u64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution, summed over peers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Router counters
    pub network: NetworkStats,

    pub messages_sent: u64,
    pub retries: u64,
    pub retries_dropped: u64,
    pub acks_received: u64,
    pub delivery_failures: u64,
    pub duplicates_suppressed: u64,

    /// Entries still waiting for an ACK at the end
    pub pending_open: usize,

    /// Ledger sizes at the end
    pub pending_entries: usize,
    pub applied_entries: usize,
}

impl ScenarioMetrics {
    fn collect(world: &SimWorld) -> Self {
        let mut metrics = ScenarioMetrics {
            network: world.stats(),
            ..Default::default()
        };
        for peer in world.peers() {
            let m = peer.messenger.metrics();
            metrics.messages_sent += m.messages_sent;
            metrics.retries += m.retries;
            metrics.retries_dropped += m.retries_dropped;
            metrics.acks_received += m.acks_received;
            metrics.delivery_failures += m.delivery_failures;
            metrics.duplicates_suppressed += m.duplicates_suppressed;
            metrics.pending_open += peer.messenger.pending_count();
            metrics.pending_entries += peer.messenger.pending().len();
            metrics.applied_entries += peer.messenger.applied_count();
        }
        metrics
    }
}

/// Runs delivery scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of peers
    num_peers: usize,

    /// Messenger settings for every peer
    messenger: MessengerConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner. At least two peers are always spawned.
    pub fn new(seed: u64, num_peers: usize) -> Self {
        Self {
            seed,
            num_peers: num_peers.max(2),
            messenger: MessengerConfig::default(),
        }
    }

    /// Overrides the messenger settings.
    pub fn with_messenger_config(mut self, config: MessengerConfig) -> Self {
        self.messenger = config;
        self
    }

    /// Runs a scenario on a private single-threaded runtime.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime.block_on(self.run_async(scenario)),
            Err(e) => ScenarioResult {
                scenario,
                seed: self.seed,
                passed: false,
                total_ticks: 0,
                final_time_ms: 0,
                failure_reason: Some(SimError::Runtime(e.to_string()).to_string()),
                metrics: ScenarioMetrics::default(),
            },
        }
    }

    /// Runs a scenario on the caller's runtime.
    pub async fn run_async(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let mut world = SimWorld::new(self.sim_config(scenario));
        let outcome = match world.spawn_peers() {
            Ok(_) => match scenario {
                ScenarioId::DeliveryBaseline => self.run_delivery_baseline(&mut world).await,
                ScenarioId::TotalLoss => self.run_total_loss(&mut world).await,
                ScenarioId::DuplicateDelivery => self.run_duplicate_delivery(&mut world).await,
                ScenarioId::LossyLink => self.run_lossy_link(&mut world).await,
                ScenarioId::PartitionHeal => self.run_partition_heal(&mut world).await,
                ScenarioId::LateJoinerSync => self.run_late_joiner_sync(&mut world).await,
                ScenarioId::MemoryBound => self.run_memory_bound(&mut world).await,
            },
            Err(e) => Err(SimError::from(e)),
        };

        let failure_reason = outcome.err().map(|e| e.to_string());
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            total_ticks: world.tick_count(),
            final_time_ms: world.elapsed_ms(),
            failure_reason,
            metrics: ScenarioMetrics::collect(&world),
        }
    }

    fn sim_config(&self, scenario: ScenarioId) -> SimConfig {
        let mut config = SimConfig {
            seed: self.seed,
            num_peers: self.num_peers,
            messenger: self.messenger.clone(),
            ..Default::default()
        };
        if scenario == ScenarioId::LossyLink {
            // A pending entry closes on the first ACK from anyone, so only a
            // single receiver is guaranteed to converge under loss.
            config.num_peers = 2;
            config.messenger.attempt_limit = config.messenger.attempt_limit.max(30);
        }
        config
    }

    /// one change over clean links.
    ///
    /// **Assertion**: applied at every peer in one delivery cycle, ACKed within
    /// 2x the ACK timeout, entry reclaimed after the grace window.
    async fn run_delivery_baseline(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let config = world.config.messenger.clone();
        let sent = world
            .peer_mut(0)
            .messenger
            .change_state("n1", NodeState::Emergency)
            .await?;
        world.settle().await;

        for (i, peer) in world.peers().iter().enumerate().skip(1) {
            let state = peer.messenger.entity("n1").map(|e| e.state);
            ensure(state == Some(NodeState::Emergency), || {
                format!("peer {} has n1 = {:?} after one delivery cycle", i, state)
            })?;
        }

        let sender = &world.peer(0).messenger;
        ensure(sender.pending_count() == 0, || "no ACK reached the sender".into())?;
        let latency = sender.metrics().last_latency_ms;
        ensure(latency.is_some_and(|l| l <= 2 * config.ack_timeout_ms), || {
            format!("ACK latency {:?} exceeds 2x timeout", latency)
        })?;

        world.run_for(config.ack_grace_ms + config.cleanup_interval_ms).await;

        let sender = &world.peer(0).messenger;
        ensure(sender.pending().get(&sent.id).is_none(), || {
            "acknowledged entry survived the grace window".into()
        })?;
        ensure(sender.metrics().retries == 0, || {
            format!("{} retries on a clean link", sender.metrics().retries)
        })
    }

    /// total loss on every link.
    ///
    /// **Assertion**: exactly `attemptLimit - 1` retransmissions, entry closed
    /// as failed on retry tick `attemptLimit`, receivers untouched.
    async fn run_total_loss(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let config = world.config.messenger.clone();
        world.network_controller.set_default(ChaosConfig::lossy(1.0));

        let sent = world
            .peer_mut(0)
            .messenger
            .change_state("n1", NodeState::Emergency)
            .await?;
        world.settle().await;

        for tick in 1..=config.attempt_limit {
            world.advance(config.ack_timeout_ms).await;
            let entry = world.peer(0).messenger.pending().get(&sent.id).cloned();
            let closed = entry.as_ref().is_some_and(|e| e.acknowledged);
            debug!(tick, closed, "total loss retry tick");
            if tick < config.attempt_limit {
                ensure(!closed, || format!("gave up early on tick {}", tick))?;
            }
        }

        let sender = &world.peer(0).messenger;
        let entry = sender
            .pending()
            .get(&sent.id)
            .ok_or_else(|| SimError::Assertion("pending entry vanished".into()))?;
        ensure(entry.acknowledged && entry.failed, || "entry not closed as failed".into())?;
        ensure(sender.metrics().acks_received == 0, || "ACK arrived through a dead link".into())?;

        let expected = (config.attempt_limit - 1) as u64;
        ensure(sender.metrics().retries == expected, || {
            format!("retries = {}, expected {}", sender.metrics().retries, expected)
        })?;

        for (i, peer) in world.peers().iter().enumerate().skip(1) {
            let state = peer.messenger.entity("n1").map(|e| e.state);
            ensure(state == Some(NodeState::Normal), || {
                format!("peer {} changed to {:?} despite total loss", i, state)
            })?;
        }
        Ok(())
    }

    /// the same envelope delivered twice.
    ///
    /// **Assertion**: state changes once; the duplicate triggers one more ACK.
    async fn run_duplicate_delivery(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let sent = world
            .peer_mut(0)
            .messenger
            .change_state("n1", NodeState::Emergency)
            .await?;
        world.settle().await;

        let receiver = &world.peer(1).messenger;
        ensure(
            receiver.entity("n1").map(|e| e.state) == Some(NodeState::Emergency),
            || "first delivery not applied".into(),
        )?;

        // Local edit on the receiver makes a second application visible
        let edited = world.peer(1).messenger.entity("n1").cloned();
        if let Some(mut entity) = edited {
            entity.state = NodeState::Warning;
            world.peer_mut(1).messenger.upsert_entity(entity);
        }

        let acks_before = world.stats().acks_posted;
        ensure(world.inject(1, sent.next_attempt()), || "receiver inbox closed".into())?;
        world.settle().await;

        let receiver = &world.peer(1).messenger;
        ensure(
            receiver.entity("n1").map(|e| e.state) == Some(NodeState::Warning),
            || "duplicate was applied again".into(),
        )?;
        ensure(receiver.metrics().duplicates_suppressed == 1, || {
            format!("{} duplicates suppressed", receiver.metrics().duplicates_suppressed)
        })?;

        let extra_acks = world.stats().acks_posted - acks_before;
        ensure(extra_acks == 1, || format!("{} ACKs for the duplicate, expected 1", extra_acks))?;
        ensure(world.peer(0).messenger.metrics().acks_received == 1, || {
            "second ACK closed the entry again".into()
        })
    }

    /// 50% loss on every link.
    ///
    /// **Assertion**: every change reaches the receiver and every entry closes.
    async fn run_lossy_link(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let config = world.config.messenger.clone();
        world.network_controller.set_default(ChaosConfig::lossy(0.5));

        let changes = [
            ("n1", NodeState::Warning),
            ("n2", NodeState::Emergency),
            ("n3", NodeState::Warning),
            ("n4", NodeState::Emergency),
            ("n5", NodeState::Warning),
        ];
        for (entity, state) in changes {
            world.peer_mut(0).messenger.change_state(entity, state).await?;
            world.tick().await;
        }

        for _ in 0..config.attempt_limit * 2 {
            if world.peer(0).messenger.pending_count() == 0 {
                break;
            }
            world.tick().await;
        }

        let sender = &world.peer(0).messenger;
        ensure(sender.pending_count() == 0, || {
            format!("{} entries still open", sender.pending_count())
        })?;

        let receiver = &world.peer(1).messenger;
        for (entity, state) in changes {
            let seen = receiver.entity(entity).map(|e| e.state);
            ensure(seen == Some(state), || format!("{} = {:?}, expected {}", entity, seen, state))?;
        }
        Ok(())
    }

    /// sender partitioned for two retry periods.
    ///
    /// **Assertion**: retries through the partition are spent, the change lands
    /// on the first retry after healing.
    async fn run_partition_heal(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let ids = world.peer_ids();
        world
            .network_controller
            .partition(vec![ids[0]], ids[1..].to_vec());

        world
            .peer_mut(0)
            .messenger
            .change_state("n2", NodeState::Emergency)
            .await?;
        world.settle().await;
        world.tick().await;
        world.tick().await;

        ensure(world.stats().partitioned > 0, || "partition blocked nothing".into())?;
        ensure(world.peer(0).messenger.pending_count() == 1, || {
            "entry closed while partitioned".into()
        })?;

        world.network_controller.heal_all();
        world.tick().await;

        for (i, peer) in world.peers().iter().enumerate().skip(1) {
            let state = peer.messenger.entity("n2").map(|e| e.state);
            ensure(state == Some(NodeState::Emergency), || {
                format!("peer {} has n2 = {:?} after healing", i, state)
            })?;
        }
        let sender = &world.peer(0).messenger;
        ensure(sender.pending_count() == 0, || "no ACK after healing".into())?;
        ensure(sender.metrics().retries == 3, || {
            format!("retries = {}, expected 3", sender.metrics().retries)
        })
    }

    /// an empty peer joins and receives a snapshot.
    ///
    /// **Assertion**: the late peer's registry equals the sender's.
    async fn run_late_joiner_sync(&self, world: &mut SimWorld) -> Result<(), SimError> {
        world
            .peer_mut(0)
            .messenger
            .change_state("n1", NodeState::Emergency)
            .await?;
        world.tick().await;
        world
            .peer_mut(0)
            .messenger
            .change_state("n3", NodeState::Warning)
            .await?;
        world.tick().await;

        world.add_peer(Vec::new())?;
        let late = world.peer_count() - 1;
        ensure(world.peer(late).messenger.entities().is_empty(), || {
            "late joiner started with entities".into()
        })?;

        world.peer_mut(0).messenger.share_snapshot().await?;
        world.settle().await;

        let expected = world.peer(0).messenger.entities().to_vec();
        let seen = world.peer(late).messenger.entities().to_vec();
        ensure(seen == expected, || {
            format!("late joiner has {} entities, expected {}", seen.len(), expected.len())
        })
    }

    /// steady traffic, then silence.
    ///
    /// **Assertion**: both ledgers are empty everywhere once the retention
    /// window has passed.
    async fn run_memory_bound(&self, world: &mut SimWorld) -> Result<(), SimError> {
        let config = world.config.messenger.clone();
        let states = [NodeState::Warning, NodeState::Emergency, NodeState::Normal];

        for i in 0..20 {
            let entity = format!("n{}", i % 5 + 1);
            let sender = i % world.peer_count();
            world
                .peer_mut(sender)
                .messenger
                .change_state(&entity, states[i % states.len()])
                .await?;
            world.tick().await;
        }

        let peak: usize = world.peers().iter().map(|p| p.messenger.applied_count()).sum();
        ensure(peak > 0, || "nothing was applied".into())?;

        world
            .run_for(config.applied_retention_ms + config.cleanup_interval_ms + config.ack_grace_ms)
            .await;

        for (i, peer) in world.peers().iter().enumerate() {
            let pending = peer.messenger.pending().len();
            let applied = peer.messenger.applied_count();
            ensure(pending == 0 && applied == 0, || {
                format!("peer {} retains {} pending / {} applied", i, pending, applied)
            })?;
        }
        Ok(())
    }
}

//! Every delivery scenario, across a spread of seeds.

use healer_core::{ChaosConfig, MessengerConfig, NodeState};
use healer_sim::scenarios::ScenarioId;
use healer_sim::{ScenarioRunner, SimConfig, SimWorld};
use proptest::prelude::*;

const SEEDS: [u64; 5] = [1, 7, 42, 1337, 0xDEAD_BEEF];

fn assert_passes(scenario: ScenarioId) {
    for seed in SEEDS {
        let result = ScenarioRunner::new(seed, 3).run(scenario);
        assert!(
            result.passed,
            "{} seed={} failed: {:?}",
            scenario,
            seed,
            result.failure_reason
        );
    }
}

#[test]
fn delivery_baseline_passes() {
    assert_passes(ScenarioId::DeliveryBaseline);
}

#[test]
fn total_loss_gives_up_after_limit() {
    assert_passes(ScenarioId::TotalLoss);

    let result = ScenarioRunner::new(3, 2).run(ScenarioId::TotalLoss);
    assert_eq!(result.metrics.retries, 4);
    assert_eq!(result.metrics.delivery_failures, 1);
    assert_eq!(result.metrics.network.delivered, 5); // echoes only
}

#[test]
fn total_loss_follows_attempt_limit() {
    let config = MessengerConfig::default().with_attempt_limit(8);
    let result = ScenarioRunner::new(5, 2)
        .with_messenger_config(config)
        .run(ScenarioId::TotalLoss);
    assert!(result.passed, "{:?}", result.failure_reason);
    assert_eq!(result.metrics.retries, 7);
}

#[test]
fn duplicate_delivery_applies_once() {
    assert_passes(ScenarioId::DuplicateDelivery);
}

#[test]
fn lossy_link_converges() {
    assert_passes(ScenarioId::LossyLink);
}

#[test]
fn partition_heals() {
    assert_passes(ScenarioId::PartitionHeal);
}

#[test]
fn late_joiner_syncs() {
    assert_passes(ScenarioId::LateJoinerSync);
}

#[test]
fn ledgers_drain() {
    assert_passes(ScenarioId::MemoryBound);
}

#[test]
fn invalid_messenger_config_fails_setup() {
    let config = MessengerConfig::default().with_attempt_limit(0);
    let result = ScenarioRunner::new(1, 2)
        .with_messenger_config(config)
        .run(ScenarioId::DeliveryBaseline);
    assert!(!result.passed);
    assert!(result.failure_reason.unwrap().contains("setup"));
}

#[tokio::test]
async fn world_runs_on_callers_runtime() {
    let result = ScenarioRunner::new(9, 3)
        .run_async(ScenarioId::PartitionHeal)
        .await;
    assert!(result.passed, "{:?}", result.failure_reason);
    assert!(result.metrics.network.partitioned > 0);
}

async fn lossy_trace(seed: u64) -> (Vec<NodeState>, u64, u64) {
    let mut world = SimWorld::new(SimConfig {
        seed,
        num_peers: 2,
        messenger: MessengerConfig::default().with_attempt_limit(30),
        ..Default::default()
    });
    world.spawn_peers().unwrap();
    world.network_controller.set_default(ChaosConfig::lossy(0.4));

    for (entity, state) in [("n1", NodeState::Warning), ("n2", NodeState::Emergency)] {
        world.peer_mut(0).messenger.change_state(entity, state).await.unwrap();
        world.tick().await;
    }
    world.run_for(3_000).await;

    let states = world
        .peer(1)
        .messenger
        .entities()
        .iter()
        .map(|e| e.state)
        .collect();
    let metrics = world.peer(0).messenger.metrics();
    (states, metrics.retries, world.stats().lost)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn same_seed_same_run(seed in 1u64..10_000) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let first = runtime.block_on(lossy_trace(seed));
        let second = runtime.block_on(lossy_trace(seed));
        prop_assert_eq!(first, second);
    }
}

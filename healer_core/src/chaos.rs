//! The Chaos Injector - probabilistic drop and latency.
//!
//! A policy, not a component: every transmission attempt is judged on its
//! own, whether it comes from the original send, the retry loop, or the
//! simulator's link model. Drop and delay are mutually exclusive.
//!
//! `ChaosTransport` applies the policy as a decorator around any
//! `Transport`, so callers see a drop as `Err(EnvError::Dropped)` and never
//! branch on chaos settings themselves.

use async_trait::async_trait;
use healer_env::{ContextId, EnvError, Envelope, HealerContext, Subscription, Transport};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::HealerError;

/// Persisted chaos parameters for one context
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosConfig {
    /// Probability in [0, 1] that a transmission is skipped
    pub drop_probability: f64,
    /// Lower bound of injected latency
    pub min_latency_ms: u64,
    /// Upper bound of injected latency (inclusive)
    pub max_latency_ms: u64,
}

impl ChaosConfig {
    /// No loss, no latency.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Loss only.
    pub fn lossy(drop_probability: f64) -> Self {
        Self {
            drop_probability,
            ..Self::default()
        }
    }

    /// Adds a latency range.
    pub fn with_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.min_latency_ms = min_ms;
        self.max_latency_ms = max_ms;
        self
    }

    pub fn validate(&self) -> Result<(), HealerError> {
        if !(0.0..=1.0).contains(&self.drop_probability) {
            return Err(HealerError::InvalidConfig(format!(
                "drop probability {} outside [0, 1]",
                self.drop_probability
            )));
        }
        if self.min_latency_ms > self.max_latency_ms {
            return Err(HealerError::InvalidConfig(format!(
                "latency range [{}, {}] is inverted",
                self.min_latency_ms, self.max_latency_ms
            )));
        }
        Ok(())
    }

    pub fn is_disabled(&self) -> bool {
        self.drop_probability <= 0.0 && self.max_latency_ms == 0
    }
}

/// What to do with one transmission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosDecision {
    Deliver,
    Drop,
    Delay(Duration),
}

/// Runtime-adjustable chaos policy.
#[derive(Debug, Default)]
pub struct ChaosPolicy {
    config: RwLock<ChaosConfig>,
}

impl ChaosPolicy {
    pub fn new(config: ChaosConfig) -> Result<Self, HealerError> {
        config.validate()?;
        Ok(Self {
            config: RwLock::new(config),
        })
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn config(&self) -> ChaosConfig {
        *self.config.read().unwrap()
    }

    /// Replaces the parameters. Invalid configs are rejected and the old
    /// ones stay in force.
    pub fn set_config(&self, config: ChaosConfig) -> Result<(), HealerError> {
        config.validate()?;
        *self.config.write().unwrap() = config;
        Ok(())
    }

    /// Judges one attempt from two uniform `[0, 1)` rolls.
    pub fn decide(&self, drop_roll: f64, latency_roll: f64) -> ChaosDecision {
        decide_with(&self.config(), drop_roll, latency_roll)
    }
}

/// Pure decision function shared by the policy and the simulator.
pub fn decide_with(config: &ChaosConfig, drop_roll: f64, latency_roll: f64) -> ChaosDecision {
    if drop_roll < config.drop_probability {
        return ChaosDecision::Drop;
    }
    if config.max_latency_ms == 0 {
        return ChaosDecision::Deliver;
    }

    let span = config.max_latency_ms - config.min_latency_ms;
    let offset = ((latency_roll.clamp(0.0, 1.0)) * span.saturating_add(1) as f64).floor() as u64;
    let delay_ms = config.min_latency_ms.saturating_add(offset).min(config.max_latency_ms);

    if delay_ms == 0 {
        ChaosDecision::Deliver
    } else {
        ChaosDecision::Delay(Duration::from_millis(delay_ms))
    }
}

/// Transport decorator that applies a `ChaosPolicy` to every send.
pub struct ChaosTransport<Ctx, T>
where
    Ctx: HealerContext,
    T: Transport,
{
    inner: Arc<T>,
    context: Arc<Ctx>,
    policy: Arc<ChaosPolicy>,
}

impl<Ctx, T> ChaosTransport<Ctx, T>
where
    Ctx: HealerContext,
    T: Transport,
{
    pub fn new(inner: Arc<T>, context: Arc<Ctx>, policy: Arc<ChaosPolicy>) -> Self {
        Self {
            inner,
            context,
            policy,
        }
    }

    /// Handle for adjusting (or persisting) the chaos parameters.
    pub fn policy(&self) -> Arc<ChaosPolicy> {
        Arc::clone(&self.policy)
    }

    pub fn inner(&self) -> &Arc<T> {
        &self.inner
    }
}

#[async_trait]
impl<Ctx, T> Transport for ChaosTransport<Ctx, T>
where
    Ctx: HealerContext,
    T: Transport,
{
    async fn send(&self, envelope: Envelope) -> Result<(), EnvError> {
        let drop_roll = self.context.random_f64();
        let latency_roll = self.context.random_f64();

        match self.policy.decide(drop_roll, latency_roll) {
            ChaosDecision::Deliver => self.inner.send(envelope).await,
            ChaosDecision::Drop => {
                trace!(id = %envelope.id, attempt = envelope.attempt_count, "chaos drop");
                Err(EnvError::Dropped)
            }
            ChaosDecision::Delay(delay) => {
                trace!(id = %envelope.id, delay_ms = delay.as_millis() as u64, "chaos delay");
                let inner = Arc::clone(&self.inner);
                let context = Arc::clone(&self.context);
                self.context.spawn("chaos-delay", async move {
                    context.sleep(delay).await;
                    let id = envelope.id;
                    if let Err(e) = inner.send(envelope).await {
                        debug!(id = %id, "delayed send failed: {}", e);
                    }
                });
                Ok(())
            }
        }
    }

    fn subscribe(&self) -> Result<Subscription, EnvError> {
        self.inner.subscribe()
    }

    async fn open(&self) -> Result<(), EnvError> {
        self.inner.open().await
    }

    async fn close(&self) {
        self.inner.close().await
    }

    fn local_id(&self) -> ContextId {
        self.inner.local_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingTransport;
    use healer_env::{BroadcastBus, EnvelopeKind, TokioContext};
    use proptest::prelude::*;

    #[test]
    fn test_validate_rejects_bad_probability() {
        assert!(ChaosConfig::lossy(1.5).validate().is_err());
        assert!(ChaosConfig::lossy(-0.1).validate().is_err());
        assert!(ChaosConfig::lossy(1.0).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_latency() {
        assert!(ChaosConfig::disabled().with_latency(50, 10).validate().is_err());
    }

    #[test]
    fn test_total_loss_always_drops() {
        let policy = ChaosPolicy::new(ChaosConfig::lossy(1.0)).unwrap();
        for roll in [0.0, 0.5, 0.999_999] {
            assert_eq!(policy.decide(roll, 0.5), ChaosDecision::Drop);
        }
    }

    #[test]
    fn test_disabled_always_delivers() {
        let policy = ChaosPolicy::disabled();
        assert_eq!(policy.decide(0.0, 0.0), ChaosDecision::Deliver);
        assert!(policy.config().is_disabled());
    }

    #[test]
    fn test_set_config_keeps_old_on_error() {
        let policy = ChaosPolicy::new(ChaosConfig::lossy(0.2)).unwrap();
        assert!(policy.set_config(ChaosConfig::lossy(2.0)).is_err());
        assert_eq!(policy.config().drop_probability, 0.2);
    }

    #[test]
    fn test_full_latency_range_does_not_overflow() {
        let config = ChaosConfig::disabled().with_latency(0, u64::MAX);
        assert_eq!(decide_with(&config, 1.0, 0.0), ChaosDecision::Deliver);
        assert_eq!(
            decide_with(&config, 1.0, 1.0),
            ChaosDecision::Delay(Duration::from_millis(u64::MAX))
        );
    }

    proptest! {
        #[test]
        fn prop_delay_within_bounds(
            p in 0.0f64..=1.0,
            min in 0u64..500,
            extra in 0u64..500,
            drop_roll in 0.0f64..1.0,
            latency_roll in 0.0f64..1.0,
        ) {
            let config = ChaosConfig::lossy(p).with_latency(min, min + extra);
            match decide_with(&config, drop_roll, latency_roll) {
                ChaosDecision::Drop => prop_assert!(drop_roll < p),
                ChaosDecision::Delay(d) => {
                    prop_assert!(drop_roll >= p);
                    let ms = d.as_millis() as u64;
                    prop_assert!(ms >= min && ms <= min + extra);
                }
                ChaosDecision::Deliver => {
                    prop_assert!(drop_roll >= p);
                    prop_assert_eq!(min, 0);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_chaos_transport_drop_skips_inner() {
        let bus = BroadcastBus::new();
        let inner = Arc::new(bus.endpoint(ContextId::from_seed(1)));
        let mut sub = inner.subscribe().unwrap();

        let policy = Arc::new(ChaosPolicy::new(ChaosConfig::lossy(1.0)).unwrap());
        let chaos = ChaosTransport::new(inner, TokioContext::shared(), policy.clone());

        let env = Envelope::new(EnvelopeKind::StateSync, serde_json::json!({}), chaos.local_id(), 1, 0);
        let err = chaos.send(env.clone()).await.unwrap_err();
        assert!(err.is_dropped());
        assert!(sub.try_recv().is_none());

        policy.set_config(ChaosConfig::disabled()).unwrap();
        chaos.send(env.clone()).await.unwrap();
        assert_eq!(sub.try_recv(), Some(env));
    }

    #[tokio::test]
    async fn test_chaos_transport_delay_still_delivers() {
        let bus = BroadcastBus::new();
        let inner = Arc::new(bus.endpoint(ContextId::from_seed(1)));
        let mut sub = inner.subscribe().unwrap();

        let policy = Arc::new(ChaosPolicy::new(ChaosConfig::disabled().with_latency(5, 10)).unwrap());
        let chaos = ChaosTransport::new(inner, TokioContext::shared(), policy);

        let env = Envelope::new(EnvelopeKind::StateSync, serde_json::json!({}), chaos.local_id(), 1, 0);
        chaos.send(env.clone()).await.unwrap();
        assert!(sub.try_recv().is_none());

        let delivered = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap();
        assert_eq!(delivered, Some(env));
    }

    #[tokio::test]
    async fn test_delayed_send_into_closed_transport_is_absorbed() {
        let inner = RecordingTransport::new(ContextId::from_seed(1));
        let policy = Arc::new(ChaosPolicy::new(ChaosConfig::disabled().with_latency(5, 5)).unwrap());
        let chaos = ChaosTransport::new(Arc::clone(&inner), TokioContext::shared(), policy);

        let env = Envelope::new(EnvelopeKind::StateSync, serde_json::json!({}), chaos.local_id(), 1, 0);
        chaos.send(env).await.unwrap();
        inner.close().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(inner.take_sent().is_empty());
    }
}

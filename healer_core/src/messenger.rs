//! The reliable messenger: one context's view of the Healer protocol.
//!
//! Owns the pending ledger, the applied set, the entity registry and the
//! metrics for a single context. Every mutation goes through `&mut self`, so a
//! context is single-writer by construction; the periodic drivers live in
//! [`crate::runtime`] or, in the simulator, in the scenario loop.
//!
//! Chaos is not handled here. Wrap the transport in a
//! [`ChaosTransport`](crate::chaos::ChaosTransport) and the messenger only
//! ever sees `Err(EnvError::Dropped)`.

use healer_env::{ContextId, EnvError, Envelope, EnvelopeKind, HealerContext, MessageId, Transport};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::applied::AppliedSet;
use crate::chaos::ChaosPolicy;
use crate::config::MessengerConfig;
use crate::entity::{Entity, EntityRegistry, NodeState, Position};
use crate::error::HealerError;
use crate::ledger::{AckMatch, PendingLedger};
use crate::metrics::MessagingMetrics;
use crate::payload::{MessageBody, StateChange, StateSync};
use crate::store::ContextSnapshot;

/// How an inbound envelope was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Novel foreign envelope, applied locally
    Applied,
    /// Already applied; the ACK was re-sent
    Duplicate,
    /// ACK that closed one of our pending entries
    AckMatched,
    /// ACK for an entry that is closed or unknown here
    AckIgnored,
    /// Our own broadcast coming back
    OwnEcho,
    /// Unknown kind or malformed payload
    Unrecognized,
    /// Context already closed
    Closed,
}

impl ReceiveOutcome {
    /// Whether the envelope was legitimately processed or already known.
    pub fn handled(&self) -> bool {
        !matches!(
            self,
            ReceiveOutcome::OwnEcho | ReceiveOutcome::Unrecognized | ReceiveOutcome::Closed
        )
    }

    /// Whether the caller still owes the origin an ACK.
    pub fn needs_ack(&self) -> bool {
        matches!(self, ReceiveOutcome::Applied)
    }
}

/// Result of one retry pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// Retransmissions that reached the transport
    pub retransmitted: usize,
    /// Retries swallowed by chaos or a failing transport
    pub dropped: usize,
    /// Entries closed because their attempts ran out
    pub gave_up: Vec<MessageId>,
}

/// Result of one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub pending_removed: usize,
    pub applied_removed: usize,
}

pub struct ReliableMessenger<Ctx, T>
where
    Ctx: HealerContext,
    T: Transport,
{
    local_id: ContextId,
    context: Arc<Ctx>,
    transport: Arc<T>,
    config: MessengerConfig,
    chaos: Option<Arc<ChaosPolicy>>,
    pending: PendingLedger,
    applied: AppliedSet,
    entities: EntityRegistry,
    metrics: MessagingMetrics,
    closed: bool,
}

impl<Ctx, T> ReliableMessenger<Ctx, T>
where
    Ctx: HealerContext,
    T: Transport,
{
    /// Creates a messenger bound to `transport`. The local context id is the
    /// transport's.
    pub fn new(context: Arc<Ctx>, transport: Arc<T>, config: MessengerConfig) -> Result<Self, HealerError> {
        config.validate()?;
        Ok(Self {
            local_id: transport.local_id(),
            context,
            transport,
            config,
            chaos: None,
            pending: PendingLedger::new(),
            applied: AppliedSet::new(),
            entities: EntityRegistry::new(),
            metrics: MessagingMetrics::new(),
            closed: false,
        })
    }

    /// Attaches the chaos policy used by the transport so its parameters are
    /// included in snapshots.
    pub fn with_chaos_policy(mut self, policy: Arc<ChaosPolicy>) -> Self {
        self.chaos = Some(policy);
        self
    }

    /// Seeds the entity registry.
    pub fn with_entities(mut self, entities: impl IntoIterator<Item = Entity>) -> Self {
        self.entities = EntityRegistry::from_entities(entities);
        self
    }

    // ---------------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------------

    /// Originates an envelope.
    ///
    /// STATE_CHANGE envelopes are tracked until acknowledged; STATE_SYNC is
    /// sent once. A transmission lost to chaos is not an error: the retry
    /// loop recovers it.
    pub async fn send(&mut self, kind: EnvelopeKind, payload: serde_json::Value) -> Result<Envelope, HealerError> {
        if self.closed {
            return Err(HealerError::Closed);
        }
        if !matches!(kind, EnvelopeKind::StateChange | EnvelopeKind::StateSync) {
            return Err(HealerError::InvalidKind(kind));
        }

        let now = self.context.now_ms();
        let envelope = Envelope::new(kind, payload, self.local_id, self.config.attempt_limit, now);

        if kind == EnvelopeKind::StateChange {
            self.pending.register(envelope.clone(), now);
        }
        self.metrics.messages_sent += 1;

        match self.transport.send(envelope.clone()).await {
            Ok(()) => trace!(context = %self.local_id, id = %envelope.id, kind = %kind, "sent"),
            Err(EnvError::Dropped) => {
                debug!(context = %self.local_id, id = %envelope.id, "initial send dropped")
            }
            Err(e) => warn!(context = %self.local_id, id = %envelope.id, "send failed: {}", e),
        }

        Ok(envelope)
    }

    /// Encodes and sends a typed body.
    pub async fn send_body(&mut self, body: MessageBody) -> Result<Envelope, HealerError> {
        let (kind, payload) = body.encode()?;
        self.send(kind, payload).await
    }

    /// Applies a state change locally, then propagates it.
    pub async fn change_state(&mut self, entity_id: &str, state: NodeState) -> Result<Envelope, HealerError> {
        if self.closed {
            return Err(HealerError::Closed);
        }
        if !self.entities.apply_state(entity_id, state) {
            debug!(context = %self.local_id, entity = entity_id, "state change for unknown entity");
        }
        self.send_body(MessageBody::StateChange(StateChange {
            entity_id: entity_id.to_string(),
            new_state: state,
        }))
        .await
    }

    /// Broadcasts the whole local registry so late joiners can catch up.
    pub async fn share_snapshot(&mut self) -> Result<Envelope, HealerError> {
        let entities = self.entities.to_vec();
        self.send_body(MessageBody::StateSync(StateSync { entities })).await
    }

    /// Sends an ACK for `id`. Fire-and-forget: never tracked, never retried.
    pub async fn acknowledge(&mut self, id: MessageId) {
        let ack = Envelope::ack(id, self.local_id, self.context.now_ms());
        match self.transport.send(ack).await {
            Ok(()) => trace!(context = %self.local_id, target = %id, "ack sent"),
            Err(EnvError::Dropped) => trace!(context = %self.local_id, target = %id, "ack dropped"),
            Err(e) => debug!(context = %self.local_id, target = %id, "ack failed: {}", e),
        }
    }

    // ---------------------------------------------------------------------
    // Receiving
    // ---------------------------------------------------------------------

    /// Processes one physically delivered envelope.
    pub async fn receive(&mut self, envelope: Envelope) -> ReceiveOutcome {
        if self.closed {
            return ReceiveOutcome::Closed;
        }

        if self.applied.contains(&envelope.id) {
            if envelope.origin_id != self.local_id {
                // The first ACK may have been lost
                self.metrics.duplicates_suppressed += 1;
                debug!(context = %self.local_id, id = %envelope.id, attempt = envelope.attempt_count, "duplicate");
                self.acknowledge(envelope.id).await;
                return ReceiveOutcome::Duplicate;
            }
            return ReceiveOutcome::OwnEcho;
        }

        if envelope.origin_id == self.local_id {
            return ReceiveOutcome::OwnEcho;
        }

        self.metrics.messages_received += 1;

        let body = match MessageBody::decode(&envelope) {
            Ok(body) => body,
            Err(e) => {
                warn!(context = %self.local_id, id = %envelope.id, "rejected: {}", e);
                return ReceiveOutcome::Unrecognized;
            }
        };

        let now = self.context.now_ms();
        match body {
            MessageBody::StateChange(change) => {
                if !self.entities.apply_state(&change.entity_id, change.new_state) {
                    debug!(context = %self.local_id, entity = %change.entity_id, "unknown entity, nothing applied");
                }
                self.applied.insert(envelope.id, now);
                ReceiveOutcome::Applied
            }
            MessageBody::StateSync(sync) => {
                debug!(context = %self.local_id, entities = sync.entities.len(), "snapshot replaced");
                self.entities.replace_all(sync.entities);
                self.applied.insert(envelope.id, now);
                ReceiveOutcome::Applied
            }
            MessageBody::Ack(ack) => match self.pending.acknowledge(&ack.target_id, now) {
                AckMatch::Matched { latency_ms } => {
                    self.metrics.record_ack(latency_ms);
                    trace!(context = %self.local_id, target = %ack.target_id, latency_ms, "acknowledged");
                    ReceiveOutcome::AckMatched
                }
                AckMatch::AlreadyClosed | AckMatch::Unknown => {
                    debug!(context = %self.local_id, target = %ack.target_id, "ack for closed or unknown entry");
                    ReceiveOutcome::AckIgnored
                }
            },
        }
    }

    /// `receive` followed by the ACK the outcome calls for.
    pub async fn handle_incoming(&mut self, envelope: Envelope) -> ReceiveOutcome {
        let id = envelope.id;
        let outcome = self.receive(envelope).await;
        if outcome.needs_ack() {
            self.acknowledge(id).await;
        }
        outcome
    }

    // ---------------------------------------------------------------------
    // Periodic drivers
    // ---------------------------------------------------------------------

    /// One pass of the retry loop.
    ///
    /// Only transmissions that reach the transport count against the attempt
    /// limit; a dropped retry just consumes its timeout window.
    pub async fn retry_tick(&mut self) -> RetryReport {
        let mut report = RetryReport::default();
        if self.closed {
            return report;
        }

        let now = self.context.now_ms();
        for id in self.pending.due_for_retry(now, self.config.ack_timeout_ms) {
            let next = match self.pending.get(&id) {
                Some(entry) if entry.envelope.attempts_exhausted() => None,
                Some(entry) => Some(entry.envelope.next_attempt()),
                None => continue,
            };

            let Some(next) = next else {
                self.pending.give_up(&id);
                self.metrics.delivery_failures += 1;
                warn!(context = %self.local_id, id = %id, "gave up after {} transmissions", self.config.attempt_limit);
                report.gave_up.push(id);
                continue;
            };

            let result = self.transport.send(next.clone()).await;
            let Some(entry) = self.pending.get_mut(&id) else {
                continue;
            };
            entry.last_sent_at_ms = now;

            match result {
                Ok(()) => {
                    debug!(context = %self.local_id, id = %id, attempt = next.attempt_count, "retransmitted");
                    entry.envelope = next;
                    self.metrics.retries += 1;
                    report.retransmitted += 1;
                }
                Err(e) => {
                    if !e.is_dropped() {
                        warn!(context = %self.local_id, id = %id, "retry failed: {}", e);
                    }
                    self.metrics.retries_dropped += 1;
                    report.dropped += 1;
                }
            }
        }

        report
    }

    /// One pass of the cleanup loop.
    pub fn cleanup_tick(&mut self) -> CleanupReport {
        if self.closed {
            return CleanupReport::default();
        }
        let now = self.context.now_ms();
        let report = CleanupReport {
            pending_removed: self.pending.cleanup(now, self.config.ack_grace_ms),
            applied_removed: self.applied.cleanup(now, self.config.applied_retention_ms),
        };
        if report.pending_removed + report.applied_removed > 0 {
            debug!(
                context = %self.local_id,
                pending = report.pending_removed,
                applied = report.applied_removed,
                "cleanup"
            );
        }
        report
    }

    /// Stops all further processing and releases the transport.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.transport.close().await;
        info!(context = %self.local_id, name = %self.config.name, "closed");
    }

    // ---------------------------------------------------------------------
    // Local, non-reliable updates
    // ---------------------------------------------------------------------

    pub fn update_position(&mut self, entity_id: &str, position: Position) -> bool {
        self.entities.update_position(entity_id, position)
    }

    pub fn upsert_entity(&mut self, entity: Entity) {
        self.entities.upsert(entity);
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    /// Flat form of everything worth persisting.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            chaos: self.chaos.as_ref().map(|p| p.config()).unwrap_or_default(),
            metrics: self.metrics.clone(),
            entities: self.entities.to_vec(),
            pending: self.pending.to_records(),
            applied: self.applied.to_records(),
        }
    }

    /// Rebuilds the in-memory containers from a snapshot.
    pub fn restore(&mut self, snapshot: ContextSnapshot) -> Result<(), HealerError> {
        if let Some(policy) = &self.chaos {
            policy.set_config(snapshot.chaos)?;
        }
        self.metrics = snapshot.metrics;
        self.entities = EntityRegistry::from_entities(snapshot.entities);
        self.pending = PendingLedger::from_records(snapshot.pending);
        self.applied = AppliedSet::from_records(snapshot.applied);
        info!(
            context = %self.local_id,
            pending = self.pending.len(),
            applied = self.applied.len(),
            "restored"
        );
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn local_id(&self) -> ContextId {
        self.local_id
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn metrics(&self) -> &MessagingMetrics {
        &self.metrics
    }

    pub fn pending(&self) -> &PendingLedger {
        &self.pending
    }

    pub fn applied(&self) -> &AppliedSet {
        &self.applied
    }

    /// Entries still awaiting an ACK.
    pub fn pending_count(&self) -> usize {
        self.pending.open_count()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

//! Relay Queue
//!
//! Server-side store of in-flight envelopes awaiting acknowledgment. The
//! queue is sans-IO: it decides what is due and records what happened, while
//! the relay hub does the actual fan-out to connected peers.
//!
//! The relay has no per-peer delivery tracking. An entry moves to the
//! delivered set as soon as any peer acknowledges it.

use healer_env::{Envelope, MessageId};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle notifications for queue observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    Enqueued(MessageId),
    Acknowledged(MessageId),
    Failed(MessageId),
    Expired(MessageId),
}

/// One tracked envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEntry {
    /// Envelope as last broadcast
    pub envelope: Envelope,
    pub acknowledged: bool,
    /// Attempts exhausted; kept for inspection, never retried
    pub failed: bool,
    pub enqueued_at_ms: u64,
    pub last_sent_at_ms: u64,
    pub delivered_at_ms: Option<u64>,
}

pub struct RelayQueue {
    pending: HashMap<MessageId, RelayEntry>,
    delivered: HashMap<MessageId, RelayEntry>,
    events: broadcast::Sender<QueueEvent>,
}

impl RelayQueue {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pending: HashMap::new(),
            delivered: HashMap::new(),
            events,
        }
    }

    /// Observer channel. Lagging observers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: QueueEvent) {
        // No observers is fine
        let _ = self.events.send(event);
    }

    /// Starts tracking an envelope.
    ///
    /// Returns `false` if the id is already known (pending or delivered); the
    /// stored entry is left untouched.
    pub fn enqueue(&mut self, envelope: Envelope, now_ms: u64) -> bool {
        let id = envelope.id;
        if self.pending.contains_key(&id) || self.delivered.contains_key(&id) {
            debug!(id = %id, "already queued");
            return false;
        }

        self.pending.insert(
            id,
            RelayEntry {
                envelope,
                acknowledged: false,
                failed: false,
                enqueued_at_ms: now_ms,
                last_sent_at_ms: now_ms,
                delivered_at_ms: None,
            },
        );
        self.notify(QueueEvent::Enqueued(id));
        true
    }

    /// Moves an entry from pending to delivered.
    pub fn acknowledge(&mut self, id: &MessageId, now_ms: u64) -> bool {
        match self.pending.remove(id) {
            Some(mut entry) => {
                entry.acknowledged = true;
                entry.delivered_at_ms = Some(now_ms);
                self.delivered.insert(*id, entry);
                self.notify(QueueEvent::Acknowledged(*id));
                true
            }
            None if self.delivered.contains_key(id) => {
                debug!(id = %id, "already delivered");
                false
            }
            None => {
                warn!(id = %id, "ack for unknown relay entry");
                false
            }
        }
    }

    /// Envelopes whose retry timeout has elapsed, oldest first.
    ///
    /// Entries that have used all their transmissions are marked failed here
    /// and excluded from this and every later scan.
    pub fn pending_due_for_retry(&mut self, timeout_ms: u64, now_ms: u64) -> Vec<Envelope> {
        let mut due = Vec::new();
        let mut failed = Vec::new();

        for (id, entry) in self.pending.iter_mut() {
            if entry.failed || now_ms.saturating_sub(entry.last_sent_at_ms) < timeout_ms {
                continue;
            }
            if entry.envelope.attempts_exhausted() {
                entry.failed = true;
                failed.push(*id);
            } else {
                due.push(entry.envelope.clone());
            }
        }

        for id in failed {
            warn!(id = %id, "relay entry failed");
            self.notify(QueueEvent::Failed(id));
        }

        due.sort_by_key(|e| (e.created_at_ms, e.id));
        due
    }

    /// Bumps the attempt metadata of a pending entry and returns the envelope
    /// to broadcast.
    pub fn record_retransmission(&mut self, id: &MessageId, now_ms: u64) -> Option<Envelope> {
        let entry = self.pending.get_mut(id)?;
        if entry.failed {
            return None;
        }
        entry.envelope = entry.envelope.next_attempt();
        entry.last_sent_at_ms = now_ms;
        Some(entry.envelope.clone())
    }

    /// Purges delivered entries older than `max_age_ms` since delivery.
    /// Pending entries are never purged by age.
    pub fn cleanup(&mut self, max_age_ms: u64, now_ms: u64) -> usize {
        let expired: Vec<MessageId> = self
            .delivered
            .iter()
            .filter(|(_, e)| {
                let delivered_at = e.delivered_at_ms.unwrap_or(e.last_sent_at_ms);
                now_ms.saturating_sub(delivered_at) >= max_age_ms
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.delivered.remove(id);
            self.notify(QueueEvent::Expired(*id));
        }
        expired.len()
    }

    pub fn get(&self, id: &MessageId) -> Option<&RelayEntry> {
        self.pending.get(id).or_else(|| self.delivered.get(id))
    }

    /// Entries still being retried.
    pub fn pending_len(&self) -> usize {
        self.pending.values().filter(|e| !e.failed).count()
    }

    pub fn delivered_len(&self) -> usize {
        self.delivered.len()
    }

    /// Ids of entries still being retried, sorted.
    pub fn queue_ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, e)| !e.failed)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn delivered_ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self.delivered.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn failed_ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, e)| e.failed)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }
}

impl Default for RelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use healer_env::{ContextId, EnvelopeKind};

    fn envelope(limit: u32) -> Envelope {
        Envelope::new(
            EnvelopeKind::StateChange,
            serde_json::json!({ "entityId": "n1", "newState": "warning" }),
            ContextId::from_seed(1),
            limit,
            0,
        )
    }

    #[test]
    fn test_enqueue_and_acknowledge() {
        let mut queue = RelayQueue::new();
        let mut events = queue.subscribe();
        let env = envelope(5);
        let id = env.id;

        assert!(queue.enqueue(env.clone(), 0));
        assert!(!queue.enqueue(env, 10));
        assert_eq!(queue.pending_len(), 1);

        assert!(queue.acknowledge(&id, 50));
        assert!(!queue.acknowledge(&id, 60));
        assert!(!queue.acknowledge(&MessageId::new(), 60));
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.delivered_ids(), vec![id]);

        assert_eq!(events.try_recv().unwrap(), QueueEvent::Enqueued(id));
        assert_eq!(events.try_recv().unwrap(), QueueEvent::Acknowledged(id));
    }

    #[test]
    fn test_retry_until_failed() {
        let mut queue = RelayQueue::new();
        let env = envelope(3);
        let id = env.id;
        queue.enqueue(env, 0);

        assert!(queue.pending_due_for_retry(300, 299).is_empty());

        let mut now = 0;
        let mut retransmissions = 0;
        loop {
            now += 300;
            let due = queue.pending_due_for_retry(300, now);
            if due.is_empty() {
                break;
            }
            for env in due {
                queue.record_retransmission(&env.id, now).unwrap();
                retransmissions += 1;
            }
        }

        assert_eq!(retransmissions, 2);
        assert_eq!(queue.failed_ids(), vec![id]);
        assert_eq!(queue.pending_len(), 0);
        // Kept for inspection
        assert!(queue.get(&id).unwrap().failed);
        assert_eq!(queue.cleanup(0, now + 1_000_000), 0);
    }

    #[test]
    fn test_record_retransmission_bumps_attempt() {
        let mut queue = RelayQueue::new();
        let env = envelope(5);
        let id = env.id;
        queue.enqueue(env, 0);

        let sent = queue.record_retransmission(&id, 400).unwrap();
        assert_eq!(sent.attempt_count, 1);
        assert_eq!(queue.get(&id).unwrap().last_sent_at_ms, 400);
        assert!(queue.record_retransmission(&MessageId::new(), 400).is_none());
    }

    #[test]
    fn test_cleanup_only_delivered() {
        let mut queue = RelayQueue::new();
        let mut events = queue.subscribe();
        let delivered = envelope(5);
        let waiting = envelope(5);
        let delivered_id = delivered.id;
        queue.enqueue(delivered, 0);
        queue.enqueue(waiting, 0);
        queue.acknowledge(&delivered_id, 100);

        assert_eq!(queue.cleanup(1_000, 1_099), 0);
        assert_eq!(queue.cleanup(1_000, 1_100), 1);
        assert_eq!(queue.delivered_len(), 0);
        assert_eq!(queue.pending_len(), 1);

        let mut saw_expired = false;
        while let Ok(event) = events.try_recv() {
            saw_expired |= event == QueueEvent::Expired(delivered_id);
        }
        assert!(saw_expired);
    }
}

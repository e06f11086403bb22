//! Sender-side pending-message ledger.
//!
//! One `PendingEntry` per STATE_CHANGE envelope this context originated.
//! The retry loop mutates attempt metadata, ACK receipt closes entries, and
//! the cleanup loop reclaims closed entries after a grace window.

use healer_env::{Envelope, MessageId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sender-side bookkeeping for one envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    /// The envelope as last transmitted
    pub envelope: Envelope,

    /// Closed, either by a real ACK or by giving up
    pub acknowledged: bool,

    /// Last (re)transmission time, or the last dropped retry window
    pub last_sent_at_ms: u64,

    /// Closed because the attempt limit was exhausted
    #[serde(default)]
    pub failed: bool,
}

/// Flat, serializable form of one ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub id: MessageId,
    pub entry: PendingEntry,
}

/// Result of matching an ACK against the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMatch {
    /// Entry closed by this ACK; round trip since the last transmission
    Matched { latency_ms: u64 },
    /// Entry already closed (duplicate ACK, or gave up earlier)
    AlreadyClosed,
    /// No entry (cleaned up, or never sent from here)
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct PendingLedger {
    entries: HashMap<MessageId, PendingEntry>,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly sent envelope.
    pub fn register(&mut self, envelope: Envelope, now_ms: u64) {
        let entry = PendingEntry {
            envelope,
            acknowledged: false,
            last_sent_at_ms: now_ms,
            failed: false,
        };
        self.entries.insert(entry.envelope.id, entry);
    }

    pub fn get(&self, id: &MessageId) -> Option<&PendingEntry> {
        self.entries.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &MessageId) -> Option<&mut PendingEntry> {
        self.entries.get_mut(id)
    }

    /// Closes the entry for `target` if it is still open.
    pub fn acknowledge(&mut self, target: &MessageId, now_ms: u64) -> AckMatch {
        match self.entries.get_mut(target) {
            Some(entry) if !entry.acknowledged => {
                entry.acknowledged = true;
                AckMatch::Matched {
                    latency_ms: now_ms.saturating_sub(entry.last_sent_at_ms),
                }
            }
            Some(_) => AckMatch::AlreadyClosed,
            None => AckMatch::Unknown,
        }
    }

    /// Open entries whose ACK timeout has elapsed, oldest first.
    pub fn due_for_retry(&self, now_ms: u64, ack_timeout_ms: u64) -> Vec<MessageId> {
        let mut due: Vec<(u64, MessageId)> = self
            .entries
            .values()
            .filter(|e| !e.acknowledged)
            .filter(|e| now_ms.saturating_sub(e.last_sent_at_ms) >= ack_timeout_ms)
            .map(|e| (e.envelope.created_at_ms, e.envelope.id))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Force-closes an entry whose attempts are exhausted.
    pub fn give_up(&mut self, id: &MessageId) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.acknowledged = true;
                entry.failed = true;
                true
            }
            None => false,
        }
    }

    /// Drops closed entries older than `grace_ms` since their last
    /// transmission. Open entries are always retained.
    pub fn cleanup(&mut self, now_ms: u64, grace_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            !e.acknowledged || now_ms.saturating_sub(e.last_sent_at_ms) < grace_ms
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries still waiting for an ACK.
    pub fn open_count(&self) -> usize {
        self.entries.values().filter(|e| !e.acknowledged).count()
    }

    /// Flattens the ledger for persistence.
    pub fn to_records(&self) -> Vec<PendingRecord> {
        let mut records: Vec<PendingRecord> = self
            .entries
            .iter()
            .map(|(id, entry)| PendingRecord {
                id: *id,
                entry: entry.clone(),
            })
            .collect();
        records.sort_by_key(|r| (r.entry.envelope.created_at_ms, r.id));
        records
    }

    /// Rebuilds the map from persisted records.
    pub fn from_records(records: Vec<PendingRecord>) -> Self {
        let mut entries = HashMap::with_capacity(records.len());
        for record in records {
            entries.insert(record.id, record.entry);
        }
        Self { entries }
    }
}

//! Receiver-side duplicate-detection ledger.
//!
//! Each applied envelope id is stored with the local time it was first
//! applied. Ids are never re-applied while present, whatever their
//! `attemptCount`; they age out after the retention window.

use healer_env::MessageId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Flat, serializable form of one applied id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedRecord {
    pub id: MessageId,
    pub applied_at_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AppliedSet {
    applied: HashMap<MessageId, u64>,
}

impl AppliedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.applied.contains_key(id)
    }

    /// Records an id. Returns `false` if it was already present, in which
    /// case the original timestamp is kept.
    pub fn insert(&mut self, id: MessageId, now_ms: u64) -> bool {
        if self.applied.contains_key(&id) {
            return false;
        }
        self.applied.insert(id, now_ms);
        true
    }

    /// Drops ids applied at least `retention_ms` ago.
    pub fn cleanup(&mut self, now_ms: u64, retention_ms: u64) -> usize {
        let before = self.applied.len();
        self.applied
            .retain(|_, applied_at| now_ms.saturating_sub(*applied_at) < retention_ms);
        before - self.applied.len()
    }

    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    pub fn to_records(&self) -> Vec<AppliedRecord> {
        let mut records: Vec<AppliedRecord> = self
            .applied
            .iter()
            .map(|(id, at)| AppliedRecord {
                id: *id,
                applied_at_ms: *at,
            })
            .collect();
        records.sort_by_key(|r| (r.applied_at_ms, r.id));
        records
    }

    pub fn from_records(records: Vec<AppliedRecord>) -> Self {
        let mut set = Self::new();
        for record in records {
            set.insert(record.id, record.applied_at_ms);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_first_writer_wins() {
        let mut set = AppliedSet::new();
        let id = MessageId::from_seed(1);

        assert!(set.insert(id, 100));
        assert!(!set.insert(id, 900));
        assert_eq!(set.to_records()[0].applied_at_ms, 100);
    }

    #[test]
    fn test_cleanup_window() {
        let mut set = AppliedSet::new();
        set.insert(MessageId::from_seed(1), 0);
        set.insert(MessageId::from_seed(2), 20_000);

        assert_eq!(set.cleanup(29_999, 30_000), 0);
        assert_eq!(set.cleanup(30_000, 30_000), 1);
        assert!(set.contains(&MessageId::from_seed(2)));
        assert_eq!(set.cleanup(50_000, 30_000), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_records_rebuild_set() {
        let mut set = AppliedSet::new();
        for i in 0..5 {
            set.insert(MessageId::from_seed(i), i * 10);
        }

        let json = serde_json::to_string(&set.to_records()).unwrap();
        let restored = AppliedSet::from_records(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.len(), 5);
        for i in 0..5 {
            assert!(restored.contains(&MessageId::from_seed(i)));
        }
    }
}

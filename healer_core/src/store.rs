//! Snapshot persistence.
//!
//! A context persists a flat key-value form of its state: one section per
//! concern, each a JSON document. Ledgers are stored as record lists and
//! rebuilt into their maps on restore; nothing assumes the decoded shape
//! already behaves like the runtime container.
//!
//! Durability is best-effort. There is no write-ahead log; a crash between
//! snapshots loses whatever happened since the last one.

use healer_env::ContextId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use crate::applied::AppliedRecord;
use crate::chaos::ChaosConfig;
use crate::entity::Entity;
use crate::error::HealerError;
use crate::ledger::PendingRecord;
use crate::metrics::MessagingMetrics;

const SECTIONS: [&str; 5] = ["chaos", "metrics", "entities", "pending", "applied"];

/// Everything a context persists between runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSnapshot {
    pub chaos: ChaosConfig,
    pub metrics: MessagingMetrics,
    pub entities: Vec<Entity>,
    pub pending: Vec<PendingRecord>,
    pub applied: Vec<AppliedRecord>,
}

impl ContextSnapshot {
    fn section(&self, name: &str) -> Result<Vec<u8>, HealerError> {
        let bytes = match name {
            "chaos" => serde_json::to_vec(&self.chaos)?,
            "metrics" => serde_json::to_vec(&self.metrics)?,
            "entities" => serde_json::to_vec(&self.entities)?,
            "pending" => serde_json::to_vec(&self.pending)?,
            "applied" => serde_json::to_vec(&self.applied)?,
            other => return Err(HealerError::Storage(format!("unknown section {}", other))),
        };
        Ok(bytes)
    }

    fn set_section(&mut self, name: &str, bytes: &[u8]) -> Result<(), HealerError> {
        match name {
            "chaos" => self.chaos = serde_json::from_slice(bytes)?,
            "metrics" => self.metrics = serde_json::from_slice(bytes)?,
            "entities" => self.entities = serde_json::from_slice(bytes)?,
            "pending" => self.pending = serde_json::from_slice(bytes)?,
            "applied" => self.applied = serde_json::from_slice(bytes)?,
            other => return Err(HealerError::Storage(format!("unknown section {}", other))),
        }
        Ok(())
    }
}

/// Storage backend for context snapshots
///
/// Implementations must be thread-safe.
pub trait SnapshotStore: Send + Sync {
    /// Replaces the stored snapshot for `context`.
    fn save(&self, context: ContextId, snapshot: &ContextSnapshot) -> Result<(), HealerError>;

    /// Loads the snapshot for `context`, if one was ever saved.
    fn load(&self, context: ContextId) -> Result<Option<ContextSnapshot>, HealerError>;

    /// Forgets `context`.
    fn remove(&self, context: ContextId) -> Result<(), HealerError>;
}

/// Sled-backed store: one key per section per context.
pub struct SledSnapshotStore {
    db: sled::Db,
}

impl SledSnapshotStore {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, HealerError> {
        let db = sled::open(path)
            .map_err(|e| HealerError::Storage(format!("Failed to open sled DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Create a throwaway store that is deleted on drop
    pub fn open_temp() -> Result<Self, HealerError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| HealerError::Storage(format!("Failed to open temp DB: {}", e)))?;
        Ok(Self { db })
    }

    fn key(context: ContextId, section: &str) -> String {
        format!("{}/{}", context.as_uuid(), section)
    }
}

impl SnapshotStore for SledSnapshotStore {
    fn save(&self, context: ContextId, snapshot: &ContextSnapshot) -> Result<(), HealerError> {
        let mut batch = sled::Batch::default();
        for section in SECTIONS {
            batch.insert(Self::key(context, section).as_bytes(), snapshot.section(section)?);
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| HealerError::Storage(format!("Batch failed: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| HealerError::Storage(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    fn load(&self, context: ContextId) -> Result<Option<ContextSnapshot>, HealerError> {
        let mut snapshot = ContextSnapshot::default();
        let mut found = false;
        for section in SECTIONS {
            let value = self
                .db
                .get(Self::key(context, section).as_bytes())
                .map_err(|e| HealerError::Storage(format!("Read failed: {}", e)))?;
            if let Some(bytes) = value {
                snapshot.set_section(section, &bytes)?;
                found = true;
            }
        }
        Ok(found.then_some(snapshot))
    }

    fn remove(&self, context: ContextId) -> Result<(), HealerError> {
        for section in SECTIONS {
            self.db
                .remove(Self::key(context, section).as_bytes())
                .map_err(|e| HealerError::Storage(format!("Remove failed: {}", e)))?;
        }
        Ok(())
    }
}

/// In-memory store holding the serialized form, for tests and the simulator.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<ContextId, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, context: ContextId, snapshot: &ContextSnapshot) -> Result<(), HealerError> {
        let bytes = serde_json::to_vec(snapshot)?;
        self.snapshots.write().unwrap().insert(context, bytes);
        Ok(())
    }

    fn load(&self, context: ContextId) -> Result<Option<ContextSnapshot>, HealerError> {
        match self.snapshots.read().unwrap().get(&context) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, context: ContextId) -> Result<(), HealerError> {
        self.snapshots.write().unwrap().remove(&context);
        Ok(())
    }
}

//! Per-origin logical counters for causality comparison.
//!
//! Standalone helper: nothing in the delivery path consults it. STATE_SYNC
//! remains whole-snapshot last-writer-wins; callers that want causal tagging
//! invoke the clock explicitly.

use healer_env::ContextId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Causal relationship between two clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Happened strictly before the other clock
    Before,
    /// Happened strictly after
    After,
    /// Identical histories
    Equal,
    /// Neither dominates
    Concurrent,
}

/// A vector clock keyed by context id. Missing entries read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<ContextId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, origin: &ContextId) -> u64 {
        self.counters.get(origin).copied().unwrap_or(0)
    }

    /// Records a local event at `origin` and returns the new counter.
    pub fn increment(&mut self, origin: ContextId) -> u64 {
        let counter = self.counters.entry(origin).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (origin, theirs) in &other.counters {
            let ours = self.counters.entry(*origin).or_insert(0);
            *ours = (*ours).max(*theirs);
        }
    }

    /// Merge then tick, as on receipt of a tagged message.
    pub fn observe(&mut self, local: ContextId, remote: &VectorClock) -> u64 {
        self.merge(remote);
        self.increment(local)
    }

    pub fn compare(&self, other: &VectorClock) -> Causality {
        let mut less = false;
        let mut greater = false;

        for origin in self.counters.keys().chain(other.counters.keys()) {
            match self.get(origin).cmp(&other.get(origin)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return Causality::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            (true, true) => Causality::Concurrent,
        }
    }

    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == Causality::Before
    }

    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == Causality::Concurrent
    }
}

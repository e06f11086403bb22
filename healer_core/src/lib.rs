//! Healer Core - reliable delivery of state changes across contexts
//!
//! At-least-once propagation of small state-change events over an unreliable
//! broadcast transport:
//! 1. **Pending ledger**: every STATE_CHANGE is tracked until a peer ACKs it,
//!    retransmitted on timeout, and given up after a bounded number of tries
//! 2. **Applied set**: receivers remember what they applied, so redelivery is
//!    harmless and the lost ACK is simply re-sent
//! 3. **Chaos injector**: probabilistic loss and latency as a transport
//!    decorator, for exercising (1) and (2)
//!
//! The relay side of the protocol lives in [`relay_queue`]; the network
//! itself is abstracted by `healer_env::Transport`.

pub mod applied;
pub mod chaos;
pub mod config;
pub mod entity;
pub mod error;
pub mod ledger;
pub mod messenger;
pub mod metrics;
pub mod payload;
pub mod relay_queue;
pub mod runtime;
pub mod store;
pub mod vector_clock;

#[cfg(test)]
mod test_support;

// Re-export key types for convenience
pub use applied::{AppliedRecord, AppliedSet};
pub use chaos::{decide_with, ChaosConfig, ChaosDecision, ChaosPolicy, ChaosTransport};
pub use config::MessengerConfig;
pub use entity::{Entity, EntityRegistry, NodeState, Position};
pub use error::HealerError;
pub use ledger::{AckMatch, PendingEntry, PendingLedger, PendingRecord};
pub use messenger::{CleanupReport, ReceiveOutcome, ReliableMessenger, RetryReport};
pub use metrics::MessagingMetrics;
pub use payload::{Ack, MessageBody, StateChange, StateSync};
pub use relay_queue::{QueueEvent, RelayEntry, RelayQueue};
pub use runtime::{MessengerHandle, MessengerRuntime, MessengerStatus};
pub use store::{ContextSnapshot, MemorySnapshotStore, SledSnapshotStore, SnapshotStore};
pub use vector_clock::{Causality, VectorClock};

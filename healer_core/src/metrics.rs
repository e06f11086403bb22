//! Healer Metrics Module
//! =====================
//!
//! Per-context delivery counters. Derived, not authoritative: they may be
//! persisted and rehydrated, and losing them on restart is harmless.
//!
//! - **Sent / received**: envelopes handed to / taken from the transport
//! - **Acks received**: pending entries closed by a real ACK
//! - **Retries**: retransmissions that actually reached the transport
//! - **Delivery failures**: entries closed because attempts ran out
//! - **Last latency**: round trip of the most recently matched ACK

use serde::{Deserialize, Serialize};

/// Counters for one context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagingMetrics {
    /// Envelopes originated by `send` (chaos drops included)
    pub messages_sent: u64,
    /// Foreign envelopes taken from the transport
    pub messages_received: u64,
    /// ACKs that closed a pending entry
    pub acks_received: u64,
    /// Retransmissions handed to the transport
    pub retries: u64,
    /// Retries swallowed by the fault injector
    pub retries_dropped: u64,
    /// Entries closed without a real ACK
    pub delivery_failures: u64,
    /// Duplicates suppressed by the applied set
    pub duplicates_suppressed: u64,
    /// Round trip of the last matched ACK
    pub last_latency_ms: Option<u64>,
}

impl MessagingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of originated messages that were acknowledged.
    ///
    /// Returns 1.0 when nothing has been sent yet.
    pub fn ack_rate(&self) -> f64 {
        if self.messages_sent == 0 {
            return 1.0;
        }
        (self.acks_received as f64 / self.messages_sent as f64).min(1.0)
    }

    pub(crate) fn record_ack(&mut self, latency_ms: u64) {
        self.acks_received += 1;
        self.last_latency_ms = Some(latency_ms);
    }
}

// =============================================================================
// TESTS
// =============================================================================

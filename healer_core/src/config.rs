//! Messenger configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::HealerError;

/// Configuration for one reliable-messaging context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessengerConfig {
    /// Context's logical name (for logging)
    pub name: String,

    /// Total transmissions per envelope, original send included (default: 5)
    pub attempt_limit: u32,

    /// Time without ACK before an entry is due for retry (default: 300 ms)
    pub ack_timeout_ms: u64,

    /// Retry driver period (default: 300 ms)
    pub retry_interval_ms: u64,

    /// Cleanup driver period (default: 5000 ms)
    pub cleanup_interval_ms: u64,

    /// How long acknowledged entries linger after their last send (default: 5000 ms)
    pub ack_grace_ms: u64,

    /// How long applied ids are remembered (default: 30 s)
    pub applied_retention_ms: u64,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            name: "healer-context".to_string(),
            attempt_limit: 5,
            ack_timeout_ms: 300,
            retry_interval_ms: 300,
            cleanup_interval_ms: 5_000,
            ack_grace_ms: 5_000,
            applied_retention_ms: 30_000,
        }
    }
}

impl MessengerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_attempt_limit(mut self, limit: u32) -> Self {
        self.attempt_limit = limit;
        self
    }

    pub fn with_ack_timeout(mut self, ms: u64) -> Self {
        self.ack_timeout_ms = ms;
        self
    }

    pub fn with_intervals(mut self, retry_ms: u64, cleanup_ms: u64) -> Self {
        self.retry_interval_ms = retry_ms;
        self.cleanup_interval_ms = cleanup_ms;
        self
    }

    pub fn with_retention(mut self, ack_grace_ms: u64, applied_retention_ms: u64) -> Self {
        self.ack_grace_ms = ack_grace_ms;
        self.applied_retention_ms = applied_retention_ms;
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Worst-case time the sender keeps retransmitting one envelope.
    pub fn max_delivery_window_ms(&self) -> u64 {
        self.ack_timeout_ms
            .max(self.retry_interval_ms)
            .saturating_mul(self.attempt_limit as u64)
    }

    /// Checks internal consistency.
    ///
    /// The applied-id retention must outlive the retransmission window,
    /// otherwise a late duplicate could be applied twice.
    pub fn validate(&self) -> Result<(), HealerError> {
        if self.attempt_limit == 0 {
            return Err(HealerError::InvalidConfig("attempt limit must be > 0".into()));
        }
        if self.retry_interval_ms == 0 || self.cleanup_interval_ms == 0 {
            return Err(HealerError::InvalidConfig("driver intervals must be > 0".into()));
        }
        if self.applied_retention_ms <= self.max_delivery_window_ms() {
            return Err(HealerError::InvalidConfig(format!(
                "applied retention {}ms must exceed the delivery window {}ms",
                self.applied_retention_ms,
                self.max_delivery_window_ms()
            )));
        }
        Ok(())
    }
}

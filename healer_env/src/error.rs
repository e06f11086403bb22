//! Error types for the Healer environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Network send failed (buffer full, connection closed, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Transmission was skipped by the fault injector
    #[error("Transmission dropped")]
    Dropped,

    /// Transport has been closed (or was never opened)
    #[error("Transport closed")]
    Closed,

    /// Envelope serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// True when the failure is a deliberate chaos drop rather than a fault.
    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped)
    }
}

impl From<serde_json::Error> for EnvError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

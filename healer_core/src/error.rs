//! Error types for the protocol core.

use healer_env::{EnvError, EnvelopeKind};
use thiserror::Error;

/// Errors surfaced by the protocol core.
///
/// Transient and permanent delivery failures are deliberately absent: they
/// are recovered by retry or reported through metrics, never returned to the
/// caller of `send`.
#[derive(Debug, Error)]
pub enum HealerError {
    #[error("Envelope kind {0} cannot be sent directly")]
    InvalidKind(EnvelopeKind),

    #[error("Malformed {kind} payload: {reason}")]
    MalformedPayload { kind: EnvelopeKind, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Context has been closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(#[from] EnvError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HealerError {
    pub(crate) fn malformed(kind: EnvelopeKind, reason: impl std::fmt::Display) -> Self {
        Self::MalformedPayload {
            kind,
            reason: reason.to_string(),
        }
    }
}

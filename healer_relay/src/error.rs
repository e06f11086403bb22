//! Error types for the relay process.

use thiserror::Error;

/// Why an inbound frame was refused at the relay boundary.
///
/// Refused frames are never enqueued and never broadcast; the sender gets an
/// `error` event carrying [`AdmissionError::code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("envelope is missing `{0}`")]
    MissingField(&'static str),

    #[error("`{field}` is not a valid identifier: {value}")]
    InvalidId { field: &'static str, value: String },

    #[error("envelope type `{0}` is not accepted")]
    InvalidKind(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("attempt count {count} outside limit {limit} (relay maximum {max})")]
    InvalidAttempts { count: u32, limit: u32, max: u32 },
}

impl AdmissionError {
    /// Error code sent back to the client.
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::InvalidFrame(_) => "invalid_frame",
            _ => "invalid_envelope",
        }
    }
}

/// Startup misconfiguration. The relay refuses to start on any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required secret {0} is not set")]
    MissingSecret(&'static str),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Fatal relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

//! Healer Relay
//!
//! Server-assisted fan-out for contexts that cannot share a local broadcast
//! channel. Provides:
//! - WebSocket endpoint with shared-secret authentication on the upgrade
//! - Per-identity rate limiting and envelope admission control
//! - A relay queue with its own retry and expiry drivers
//! - HTTP health and metrics probes
//! - [`SocketTransport`], the client side, implementing `healer_env::Transport`

pub mod admission;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod http;
pub mod hub;
pub mod protocol;
pub mod rate_limit;
pub mod server;

pub use client::SocketTransport;
pub use config::RelayConfig;
pub use error::{AdmissionError, ConfigError, RelayError};
pub use hub::{RelayHub, SubmitOutcome};
pub use protocol::Frame;
pub use server::RelayServer;

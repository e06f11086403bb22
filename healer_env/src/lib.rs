//! Healer Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the Healer protocol
//! core to run in both **Production** (tokio, real sockets or an in-process
//! bus) and **Simulation** (virtual clock, routed channels) environments.
//!
//! # Core Concept: The Reactor Pattern
//!
//! For Deterministic Simulation Testing (DST), we intercept all I/O:
//! - Time (`now()`, `now_ms()`, `sleep()`)
//! - Network (`send()`, `subscribe()`)
//! - Randomness (`random_f64()`, used by the chaos injector)
//!
//! By deriving all entropy from a single 64-bit seed, any delivery bug becomes
//! reproducible via its seed number.
//!
//! # Example
//!
//! ```ignore
//! use healer_env::{HealerContext, Transport};
//!
//! async fn pump<Ctx: HealerContext, T: Transport>(ctx: &Ctx, transport: &T) {
//!     let mut inbox = transport.subscribe()?;
//!     loop {
//!         tokio::select! {
//!             Some(envelope) = inbox.recv() => handle(envelope),
//!             _ = ctx.sleep(Duration::from_millis(300)) => retry_tick(),
//!         }
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;
mod local_bus;

pub use context::HealerContext;
pub use network::{Subscription, Transport};
pub use types::{ContextId, Envelope, EnvelopeKind, MessageId};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use local_bus::{BroadcastBus, LocalBroadcast};

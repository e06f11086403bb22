//! Healer Deterministic Simulation Harness
//!
//! Runs a whole group of contexts in one process with nothing left to chance:
//! - **Time**: a virtual clock that only moves when the harness advances it
//! - **Network**: a central router with per-link loss, latency and partitions
//! - **Randomness**: every roll drawn from one ChaCha8 stream seeded per run
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        SimWorld                          │
//! │   SimContext (virtual clock + seeded RNG)                │
//! │                                                          │
//! │  ┌──────────┐   post    ┌──────────┐   judge   ┌───────┐ │
//! │  │ SimPeer  │──────────►│  router  │──────────►│ links │ │
//! │  │ messenger│◄──────────│ in_flight│◄──────────│ parts │ │
//! │  └──────────┘  deliver  └──────────┘           └───────┘ │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use healer_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 3).run(ScenarioId::TotalLoss);
//! assert!(result.passed);
//! ```

mod context;
mod network;
mod runner;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use network::{endpoint, LinkVerdict, NetworkMessage, SimNetwork, SimNetworkController};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, SimError};
pub use world::{default_entities, NetworkStats, SimConfig, SimMessenger, SimPeer, SimWorld};

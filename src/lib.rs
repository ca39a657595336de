//! orderflow-engine: online order-flow analytics for a single trading pair.
//!
//! ## Architecture
//!
//! ```text
//! depth deltas ──> OrderBookState ─┐
//!                                  ├─> OrderFlowPreprocessor ──> detectors ──> SignalManager ──> published signals
//! trades ──────────────────────────┘         │                       │
//!                                  PassiveVolumeTracker      AnomalyDetector (market health)
//! ```
//!
//! The engine ingests differential depth updates and aggressive trades,
//! maintains a fault-tolerant book, enriches every trade with passive
//! liquidity and multi-tick zone aggregates, and runs absorption,
//! exhaustion, accumulation/distribution, iceberg, delta-CVD and spoofing
//! detectors. Candidates pass a central signal manager that deduplicates,
//! resolves conflicts, applies market-health gates and publishes confirmed
//! signals.

pub mod book;
pub mod config;
pub mod detectors;
pub mod engine;
pub mod error;
pub mod feed;
pub mod manager;
pub mod num;
pub mod pipeline;
pub mod types;

#[cfg(feature = "simulator")]
pub mod sim;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use manager::ProcessedSignal;

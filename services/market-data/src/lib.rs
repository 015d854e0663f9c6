//! Swap Volume Market Data Service
//!
//! Turns a stream of swap events into trailing 5m / 1h / 24h volume views
//! per token and pushes them to live subscribers.
//!
//! # Architecture
//!
//! ```text
//!   SwapEvent channel
//!        │
//!    ┌───▼────┐
//!    │Ingress │  ← logs and counts every outcome
//!    └───┬────┘
//!        │
//!    ┌───▼────┐   apply-once   ┌─────────────┐
//!    │ Engine │ ─────────────► │  SwapStore  │
//!    └───┬────┘ ◄── snapshot ─ └─────────────┘
//!        │  (detached publish)
//!    ┌───▼────┐   dead ids    ┌────────┐
//!    │  Hub   │ ────────────► │ Reaper │
//!    └────────┘               └────────┘
//! ```
//!
//! The engine and the hub each guard their own state with their own lock
//! and never hold both at once; they only exchange `Stats` values.

pub mod series;
pub mod engine;
pub mod hub;
pub mod ingestion;

pub use engine::{Engine, EngineError, IngestSnapshot, StatsPublisher};
pub use hub::{ConnectionId, Reaper, SinkError, StatsSink, SubscriberHub};
pub use ingestion::run_ingress;
pub use series::Series;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";

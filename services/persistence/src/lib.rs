//! Persistence Gateway for swap aggregates
//!
//! The authoritative store behind the in-memory aggregation engine. It
//! provides exactly two things the engine depends on:
//!
//! - an atomic apply-once operation: check-and-mark the dedup marker for an
//!   event id, increment the per-token per-minute aggregate and register the
//!   token, all indivisibly with respect to concurrent callers;
//! - a full snapshot of every token's persisted aggregates, read at boot.
//!
//! # Store layout
//! - `dedupe:<event_id>`: existence marker with an expiry (the dedup TTL)
//! - `series:<token>`: field `"<minute>#c" | "#u" | "#q"` → stringified value
//! - `token_set`: every token that has ever been applied
//! - `lastEventID`: checkpoint of a recently applied event id

pub mod layout;
pub mod store;
pub mod sqlite;
pub mod memory;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{SeriesSnapshot, StoreError, SwapStore};

/// Applied events between two `lastEventID` checkpoints.
pub const CHECKPOINT_EVERY: u64 = 100;

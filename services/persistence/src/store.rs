//! The Persistence Gateway contract
//!
//! Any store can back the engine as long as "check-and-mark dedup" plus
//! "increment aggregate" is indivisible from the point of view of concurrent
//! callers: server-side scripting, multi-key transactions, or a
//! compare-and-swap loop combined with a durable append all qualify.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use types::swap::SwapEvent;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Blocking task failed: {0}")]
    Task(String),

    #[error("Corrupt value for {key}/{field}: {value}")]
    Corrupt {
        key: String,
        field: String,
        value: String,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Task(err.to_string())
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

/// Full persisted aggregate state: token → (series field → stringified value).
///
/// `BTreeMap` keeps iteration (and therefore boot logging) deterministic.
pub type SeriesSnapshot = BTreeMap<String, BTreeMap<String, String>>;

// ── Gateway ─────────────────────────────────────────────────────────

/// Atomic apply-once plus boot snapshot.
#[async_trait]
pub trait SwapStore: Send + Sync {
    /// Apply `event` into the aggregate for `minute`, at most once per
    /// `event_id` within the dedup TTL.
    ///
    /// Returns `Ok(true)` when this call was the first to apply the event and
    /// `Ok(false)` for a duplicate delivery. Two concurrent calls with the
    /// same `event_id` yield exactly one `true`.
    async fn apply_event(&self, event: &SwapEvent, minute: i64) -> Result<bool, StoreError>;

    /// Every known token's persisted series fields.
    async fn load_all_series(&self) -> Result<SeriesSnapshot, StoreError>;

    /// Most recent checkpointed event id, if any.
    async fn last_event_id(&self) -> Result<Option<String>, StoreError>;

    /// Drop dedup markers that expired at or before `now`.
    ///
    /// Returns the number of markers removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

//! Aggregation Engine
//!
//! Owns every token's [`Series`] behind one process-wide lock and exposes
//! three operations over them: `apply`, `stats` and `load`. The map itself
//! is never handed out.
//!
//! Dedup correctness lives in the Persistence Gateway: an event only reaches
//! the in-memory series after the store reported it as newly applied. The
//! series are a derived cache of the store and are rebuilt by `load`.
//!
//! # Apply flow
//!
//! ```text
//! SwapEvent ─► validate ─► store.apply_event ──dup──► Ok(false)
//!                               │
//!                            applied
//!                               │
//!                  lock ─► ensure series ─► advance ─► record
//!                               │
//!                  tokio::spawn(stats ─► publisher)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use persistence::layout::{self, FieldKind};
use persistence::{StoreError, SwapStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use types::bucket::{Bucket, Stats};
use types::errors::ValidationError;
use types::swap::SwapEvent;
use types::time::{minute_of, WINDOW_1H, WINDOW_24H, WINDOW_5M};

use crate::series::Series;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Persistence gateway failure: {0}")]
    Store(#[from] StoreError),

    #[error("Event minute {minute} is older than the window start {start_minute}")]
    TooOld { minute: i64, start_minute: i64 },

    #[error("Event minute {minute} is after the current minute {now_minute}")]
    FromFuture { minute: i64, now_minute: i64 },

    #[error("Invalid event: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Bucket index {index} outside the window")]
    IndexOutOfRange { index: i64 },
}

impl EngineError {
    /// Whether the event itself was refused, as opposed to the store failing.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, EngineError::Store(_))
    }
}

// ── Publishing ──────────────────────────────────────────────────────

/// Receiver of freshly computed views.
///
/// Called from a detached task after every applied event; must not block
/// for long and has no way to report failure back to ingestion.
pub trait StatsPublisher: Send + Sync {
    fn publish(&self, stats: &Stats);
}

// ── Counters ────────────────────────────────────────────────────────

/// Running totals of `apply` outcomes.
#[derive(Debug, Default)]
pub struct IngestCounters {
    applied: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`IngestCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub applied: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub failed: u64,
}

impl IngestCounters {
    fn record(&self, outcome: &Result<bool, EngineError>) {
        let counter = match outcome {
            Ok(true) => &self.applied,
            Ok(false) => &self.duplicates,
            Err(e) if e.is_rejection() => &self.rejected,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────

pub struct Engine {
    store: Arc<dyn SwapStore>,
    publisher: Option<Arc<dyn StatsPublisher>>,
    series: Mutex<HashMap<String, Series>>,
    counters: IngestCounters,
}

impl Engine {
    pub fn new(store: Arc<dyn SwapStore>) -> Self {
        Self {
            store,
            publisher: None,
            series: Mutex::new(HashMap::new()),
            counters: IngestCounters::default(),
        }
    }

    /// Notify `publisher` with the token's view after every applied event.
    pub fn with_publisher(mut self, publisher: Arc<dyn StatsPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    // Series are plain aggregates; a panic mid-update cannot leave them
    // structurally invalid, so a poisoned lock is recovered.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Series>> {
        self.series.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply one event as of the current wall clock.
    pub async fn apply(self: &Arc<Self>, event: &SwapEvent) -> Result<bool, EngineError> {
        self.apply_at(event, Utc::now()).await
    }

    /// Apply one event as of `now`.
    ///
    /// Returns `Ok(true)` when the event was newly applied and `Ok(false)`
    /// for a duplicate delivery. `TooOld`/`FromFuture` mean the store has
    /// already recorded the event but the in-memory window refused it.
    pub async fn apply_at(
        self: &Arc<Self>,
        event: &SwapEvent,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let outcome = self.apply_inner(event, now).await;
        self.counters.record(&outcome);
        outcome
    }

    async fn apply_inner(
        self: &Arc<Self>,
        event: &SwapEvent,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        event.validate()?;

        let now_minute = minute_of(now);
        // Late-arriving clocks never land in a future bucket.
        let minute = event.executed_minute().min(now_minute);

        if !self.store.apply_event(event, minute).await? {
            debug!(event_id = %event.event_id, token = %event.token, "Duplicate event");
            return Ok(false);
        }

        {
            let mut map = self.lock();
            let series = map
                .entry(event.token.clone())
                .or_insert_with(|| Series::new(event.token.clone(), now_minute));
            series.advance_to(now_minute);

            if minute < series.start_minute() {
                warn!(
                    event_id = %event.event_id,
                    token = %event.token,
                    minute,
                    start_minute = series.start_minute(),
                    "Event persisted but outside the in-memory window"
                );
                return Err(EngineError::TooOld {
                    minute,
                    start_minute: series.start_minute(),
                });
            }
            if minute > now_minute {
                return Err(EngineError::FromFuture { minute, now_minute });
            }

            let index = minute - series.start_minute();
            let bucket = series
                .bucket_mut(minute)
                .ok_or(EngineError::IndexOutOfRange { index })?;
            bucket.record(event.usd_value, event.amount);
        }

        debug!(
            event_id = %event.event_id,
            token = %event.token,
            minute,
            usd = event.usd_value,
            "Applied swap"
        );

        if let Some(publisher) = &self.publisher {
            let engine = Arc::clone(self);
            let publisher = Arc::clone(publisher);
            let token = event.token.clone();
            tokio::spawn(async move {
                let stats = engine.stats(&token, now);
                publisher.publish(&stats);
            });
        }

        Ok(true)
    }

    /// Trailing 5m/1h/24h view for `token` as of `now`.
    ///
    /// Read-only: the window is not advanced, sums are clamped to the
    /// minutes the series currently covers. Unknown tokens yield zeros.
    pub fn stats(&self, token: &str, now: DateTime<Utc>) -> Stats {
        let updated_at = now.timestamp();
        let map = self.lock();
        let Some(series) = map.get(token) else {
            return Stats::empty(token, updated_at);
        };

        let now_minute = minute_of(now);
        Stats {
            token: token.to_string(),
            window_5m: series.window(now_minute, WINDOW_5M),
            window_1h: series.window(now_minute, WINDOW_1H),
            window_24h: series.window(now_minute, WINDOW_24H),
            updated_at,
        }
    }

    /// Rebuild every series from the store as of the current wall clock.
    pub async fn load(&self) -> Result<usize, EngineError> {
        self.load_at(Utc::now()).await
    }

    /// Rebuild every series from the store's snapshot as of `now`.
    ///
    /// Fields outside the window ending at `now` are dropped, malformed
    /// fields are skipped and missing kinds stay zero. The whole token map
    /// is replaced at once. Returns the number of tokens loaded.
    pub async fn load_at(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let snapshot = self.store.load_all_series().await?;
        let now_minute = minute_of(now);

        let mut fresh = HashMap::with_capacity(snapshot.len());
        let mut restored = 0usize;
        let mut expired = 0usize;
        let mut malformed = 0usize;

        for (token, fields) in snapshot {
            let mut series = Series::new(token.clone(), now_minute);
            for (name, value) in &fields {
                let Some((minute, kind)) = layout::parse_field(name) else {
                    malformed += 1;
                    continue;
                };
                let Some(bucket) = series.bucket_mut(minute) else {
                    expired += 1;
                    continue;
                };
                if set_field(bucket, kind, value) {
                    restored += 1;
                } else {
                    warn!(token = %token, field = %name, value = %value, "Skipping malformed series value");
                    malformed += 1;
                }
            }
            fresh.insert(token, series);
        }

        let tokens = fresh.len();
        *self.lock() = fresh;

        info!(tokens, restored, expired, malformed, "Loaded series from store");
        Ok(tokens)
    }

    /// Number of tokens with a series.
    pub fn token_count(&self) -> usize {
        self.lock().len()
    }

    /// Known tokens, sorted.
    pub fn tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.lock().keys().cloned().collect();
        tokens.sort();
        tokens
    }

    pub fn counters(&self) -> IngestSnapshot {
        self.counters.snapshot()
    }
}

fn set_field(bucket: &mut Bucket, kind: FieldKind, raw: &str) -> bool {
    match kind {
        FieldKind::Count => match raw.parse::<u64>() {
            Ok(v) => {
                bucket.count = v;
                true
            }
            Err(_) => false,
        },
        FieldKind::Usd | FieldKind::Quantity => match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => {
                if kind == FieldKind::Usd {
                    bucket.usd = v;
                } else {
                    bucket.quantity = v;
                }
                true
            }
            _ => false,
        },
    }
}

//! Per-token ring buffer of one-minute buckets
//!
//! A `Series` always covers exactly `WINDOW_MINUTES` consecutive minutes:
//! `buckets[i]` holds the aggregate for minute `start_minute + i`. Advancing
//! the window shifts the buffer left and zeroes the freed slots, so a minute
//! that falls out of the window is dropped for good.

use types::bucket::Bucket;
use types::time::{window_start, WINDOW_MINUTES};

const SLOTS: usize = WINDOW_MINUTES as usize;

/// Sliding 24h window of per-minute aggregates for one token.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    token: String,
    /// Minute represented by `buckets[0]`; only ever increases.
    start_minute: i64,
    buckets: Box<[Bucket]>,
}

impl Series {
    /// Empty series whose window ends at `last_minute`.
    pub fn new(token: impl Into<String>, last_minute: i64) -> Self {
        Self {
            token: token.into(),
            start_minute: window_start(last_minute),
            buckets: vec![Bucket::ZERO; SLOTS].into_boxed_slice(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn start_minute(&self) -> i64 {
        self.start_minute
    }

    /// Last minute covered by the window.
    pub fn last_minute(&self) -> i64 {
        self.start_minute + WINDOW_MINUTES - 1
    }

    /// Slot index for `minute`, if it lies inside the window.
    pub fn slot(&self, minute: i64) -> Option<usize> {
        if minute < self.start_minute || minute > self.last_minute() {
            return None;
        }
        usize::try_from(minute - self.start_minute).ok()
    }

    pub fn bucket(&self, minute: i64) -> Option<&Bucket> {
        self.slot(minute).map(|idx| &self.buckets[idx])
    }

    pub fn bucket_mut(&mut self, minute: i64) -> Option<&mut Bucket> {
        self.slot(minute).map(|idx| &mut self.buckets[idx])
    }

    /// Move the window forward so that it ends at `target_minute`.
    ///
    /// A no-op when the window already covers `target_minute`. Returns the
    /// number of minutes evicted.
    pub fn advance_to(&mut self, target_minute: i64) -> i64 {
        let gap = target_minute - self.last_minute();
        if gap <= 0 {
            return 0;
        }

        if gap >= WINDOW_MINUTES {
            self.buckets.fill(Bucket::ZERO);
            self.start_minute = window_start(target_minute);
            return WINDOW_MINUTES;
        }

        // 0 < gap < WINDOW_MINUTES, so the cast is lossless.
        let shift = gap as usize;
        self.buckets.rotate_left(shift);
        self.buckets[SLOTS - shift..].fill(Bucket::ZERO);
        self.start_minute += gap;
        gap
    }

    /// Sum of the buckets for minutes `from..=to`, clamped to the window.
    pub fn sum_range(&self, from: i64, to: i64) -> Bucket {
        let from = from.max(self.start_minute);
        let to = to.min(self.last_minute());
        let mut total = Bucket::ZERO;
        if from > to {
            return total;
        }
        // Both bounds are inside the window after clamping.
        let lo = (from - self.start_minute) as usize;
        let hi = (to - self.start_minute) as usize;
        for bucket in &self.buckets[lo..=hi] {
            total += bucket;
        }
        total
    }

    /// Aggregate of the trailing `width` minutes ending at `now_minute`.
    pub fn window(&self, now_minute: i64, width: i64) -> Bucket {
        self.sum_range(now_minute - width + 1, now_minute)
    }

    /// Whether every bucket is zero.
    pub fn is_idle(&self) -> bool {
        self.buckets.iter().all(Bucket::is_empty)
    }
}

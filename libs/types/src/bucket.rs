//! Per-minute aggregates and the computed statistics view

use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Aggregate of all swaps executed in one calendar minute.
///
/// The zero value means "no activity".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Number of swaps
    pub count: u64,
    /// Total USD notional
    pub usd: f64,
    /// Total token quantity
    pub quantity: f64,
}

impl Bucket {
    pub const ZERO: Bucket = Bucket {
        count: 0,
        usd: 0.0,
        quantity: 0.0,
    };

    /// Record one swap
    pub fn record(&mut self, usd: f64, quantity: f64) {
        self.count += 1;
        self.usd += usd;
        self.quantity += quantity;
    }

    /// Whether the bucket holds no activity
    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.usd == 0.0 && self.quantity == 0.0
    }

    /// Reset to the zero value
    pub fn clear(&mut self) {
        *self = Bucket::ZERO;
    }
}

impl AddAssign for Bucket {
    fn add_assign(&mut self, rhs: Self) {
        self.count += rhs.count;
        self.usd += rhs.usd;
        self.quantity += rhs.quantity;
    }
}

impl AddAssign<&Bucket> for Bucket {
    fn add_assign(&mut self, rhs: &Bucket) {
        *self += *rhs;
    }
}

/// Trailing-window volume view for one token.
///
/// Computed on demand from the token's series and returned by value;
/// never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub token: String,
    pub window_5m: Bucket,
    pub window_1h: Bucket,
    pub window_24h: Bucket,
    /// Unix seconds at which the view was computed
    pub updated_at: i64,
}

impl Stats {
    /// All-zero view, used for tokens that have never been seen
    pub fn empty(token: impl Into<String>, updated_at: i64) -> Self {
        Self {
            token: token.into(),
            window_5m: Bucket::ZERO,
            window_1h: Bucket::ZERO,
            window_24h: Bucket::ZERO,
            updated_at,
        }
    }

    /// Whether every window is empty
    pub fn is_empty(&self) -> bool {
        self.window_5m.is_empty() && self.window_1h.is_empty() && self.window_24h.is_empty()
    }
}

//! Swap event types
//!
//! A `SwapEvent` is one executed token swap as delivered by ingress. Events
//! are immutable, may arrive out of order and may be delivered more than
//! once; the `event_id` is the client-supplied deduplication key.

use crate::errors::ValidationError;
use crate::time::minute_of;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Swap side from the taker's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single executed swap.
///
/// `amount` is the token quantity, `usd_value` the notional in USD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapEvent {
    pub event_id: String,
    #[serde(alias = "token_id")]
    pub token: String,
    pub amount: f64,
    #[serde(alias = "usd")]
    pub usd_value: f64,
    pub side: Side,
    pub created_at: DateTime<Utc>,
    pub executed_at: DateTime<Utc>,
}

impl SwapEvent {
    /// Minute (since the Unix epoch) in which the swap executed
    pub fn executed_minute(&self) -> i64 {
        minute_of(self.executed_at)
    }

    /// Reject events that cannot be aggregated.
    ///
    /// Identifiers must be non-empty and must not contain the `#` field
    /// separator used by the store layout; amounts must be finite and
    /// non-negative.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.event_id.trim().is_empty() {
            return Err(ValidationError::EmptyEventId);
        }
        if self.token.trim().is_empty() {
            return Err(ValidationError::EmptyToken {
                event_id: self.event_id.clone(),
            });
        }
        if self.token.contains('#') {
            return Err(ValidationError::ReservedCharacter {
                field: "token",
                value: self.token.clone(),
            });
        }
        check_amount("amount", self.amount)?;
        check_amount("usd_value", self.usd_value)?;
        Ok(())
    }
}

fn check_amount(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::InvalidAmount { field, value });
    }
    Ok(())
}

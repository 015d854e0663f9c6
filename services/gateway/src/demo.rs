//! Synthetic swap generator for local runs.
//!
//! Emits one event per tick, rotating through a few tokens, and re-sends
//! every `DUPLICATE_EVERY`-th event so the dedup path is exercised.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use types::swap::{Side, SwapEvent};
use uuid::Uuid;

pub const DEMO_TOKENS: [&str; 3] = ["ETH", "BTC", "SOL"];

const DUPLICATE_EVERY: u64 = 123;

/// Deterministic, seeded event source.
pub struct DemoProducer {
    sequence: u64,
    rng: ChaCha8Rng,
}

impl DemoProducer {
    pub fn new(seed: u64) -> Self {
        Self {
            sequence: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Next synthetic event, executed at `now`.
    pub fn next_event(&mut self, now: DateTime<Utc>) -> SwapEvent {
        self.sequence += 1;
        let n = self.sequence;
        let token = DEMO_TOKENS[(n % DEMO_TOKENS.len() as u64) as usize];
        let side = if n % 2 == 0 { Side::Buy } else { Side::Sell };
        let amount: f64 = self.rng.gen_range(0.1..=2.0);
        let usd_value = 1111.1 + (n % 100) as f64 + self.rng.gen_range(0.0..10.0);

        SwapEvent {
            event_id: Uuid::now_v7().to_string(),
            token: token.to_string(),
            amount,
            usd_value,
            side,
            created_at: now - chrono::Duration::seconds((n % 100) as i64),
            executed_at: now,
        }
    }

    /// Whether the most recent event should be delivered twice.
    pub fn should_duplicate(&self) -> bool {
        self.sequence % DUPLICATE_EVERY == 0
    }
}

/// Feed `tx` every `interval` until cancelled or the receiver is gone.
pub async fn run_demo_producer(
    tx: mpsc::Sender<SwapEvent>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut producer = DemoProducer::new(Utc::now().timestamp_millis() as u64);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(interval_ms = interval.as_millis() as u64, "Demo producer started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let event = producer.next_event(Utc::now());
        let duplicate = producer.should_duplicate().then(|| event.clone());

        if tx.send(event).await.is_err() {
            break;
        }
        if let Some(again) = duplicate {
            debug!(event_id = %again.event_id, "Re-sending event");
            if tx.send(again).await.is_err() {
                break;
            }
        }
    }

    info!(sent = producer.sequence, "Demo producer stopped");
}

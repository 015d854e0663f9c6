//! Property tests for window sums and eviction

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use market_data::{Engine, Series};
use persistence::MemoryStore;
use proptest::prelude::*;
use types::swap::{Side, SwapEvent};
use types::time::{minute_of, WINDOW_MINUTES};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 16, 22, 30, 15).unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The 24h window equals the sum of every applied event still inside
    /// `[now - 1439, now]`, whatever the arrival order.
    #[test]
    fn prop_window_24h_matches_applied_events(
        events in prop::collection::vec((0i64..2_000, 1u32..10_000, 1u32..100), 1..60)
    ) {
        let rt = runtime();
        let engine = Arc::new(Engine::new(Arc::new(MemoryStore::default())));
        let now = now();
        let now_minute = minute_of(now);

        let (mut count, mut usd, mut qty) = (0u64, 0.0f64, 0.0f64);
        for (i, (minutes_ago, usd_value, amount)) in events.iter().enumerate() {
            let at = now - Duration::minutes(*minutes_ago);
            let event = SwapEvent {
                event_id: format!("ev-{i}"),
                token: "BTC".to_string(),
                amount: f64::from(*amount),
                usd_value: f64::from(*usd_value),
                side: Side::Sell,
                created_at: at,
                executed_at: at,
            };
            let applied = rt.block_on(engine.apply_at(&event, now)).unwrap_or(false);
            let inside = minute_of(at) > now_minute - WINDOW_MINUTES;
            prop_assert_eq!(applied, inside);
            if inside {
                count += 1;
                usd += f64::from(*usd_value);
                qty += f64::from(*amount);
            }
        }

        let st = engine.stats("BTC", now);
        prop_assert_eq!(st.window_24h.count, count);
        prop_assert_eq!(st.window_24h.usd, usd);
        prop_assert_eq!(st.window_24h.quantity, qty);
    }

    /// Advancing by `k` keeps every surviving minute and zeroes the rest.
    #[test]
    fn prop_advance_preserves_surviving_minutes(
        recorded in prop::collection::btree_set(0i64..WINDOW_MINUTES, 0..50),
        k in 0i64..3_000,
    ) {
        let last = minute_of(now());
        let mut series = Series::new("ETH", last);
        let start = series.start_minute();
        for offset in &recorded {
            series.bucket_mut(start + offset).unwrap().record(1.0, 1.0);
        }

        series.advance_to(last + k);
        prop_assert_eq!(series.last_minute(), last + k);
        prop_assert_eq!(series.start_minute(), start + k);

        for minute in series.start_minute()..=series.last_minute() {
            let was_recorded = minute <= last && recorded.contains(&(minute - start));
            prop_assert_eq!(series.bucket(minute).unwrap().count, u64::from(was_recorded));
        }
        let survivors = recorded.iter().filter(|&&o| o >= k).count() as u64;
        prop_assert_eq!(series.sum_range(i64::MIN, i64::MAX).count, survivors);
    }
}

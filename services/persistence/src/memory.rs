//! In-process Persistence Gateway
//!
//! Same contract and same stored representation as the SQLite store, kept
//! behind one mutex. Nothing survives the process; used by tests and by
//! embedders that only need the dedup semantics.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use types::swap::SwapEvent;

use crate::layout::{self, FieldKind};
use crate::store::{SeriesSnapshot, StoreError, SwapStore};
use crate::CHECKPOINT_EVERY;

#[derive(Default)]
struct Inner {
    /// dedupe key → expiry (Unix seconds)
    dedupe: HashMap<String, i64>,
    /// token → series fields
    series: SeriesSnapshot,
    tokens: BTreeSet<String>,
    last_event_id: Option<String>,
    applied: u64,
    /// Remaining calls that fail with `StoreError::Unavailable`.
    fail_next: u32,
}

/// In-memory implementation of [`SwapStore`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
    dedupe_ttl_secs: i64,
}

impl MemoryStore {
    pub fn new(dedupe_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            dedupe_ttl_secs: i64::try_from(dedupe_ttl.as_secs()).unwrap_or(i64::MAX),
        }
    }

    /// Write a raw series field, registering the token.
    ///
    /// Lets callers stage arbitrary (including partial or malformed)
    /// persisted state before a boot load.
    pub fn seed(&self, token: &str, field: &str, value: &str) {
        let mut inner = self.lock_unchecked();
        inner.tokens.insert(token.to_string());
        inner
            .series
            .entry(token.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    /// Make the next `n` gateway calls fail.
    pub fn fail_next(&self, n: u32) {
        self.lock_unchecked().fail_next = n;
    }

    /// Number of live dedup markers.
    pub fn marker_count(&self) -> usize {
        self.lock_unchecked().dedupe.len()
    }

    fn lock_unchecked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let mut inner = self.lock_unchecked();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(25 * 3600))
    }
}

fn add_count(
    fields: &mut BTreeMap<String, String>,
    key: &str,
    name: String,
) -> Result<(), StoreError> {
    let current = match fields.get(&name) {
        Some(raw) => raw.parse::<u64>().map_err(|_| StoreError::Corrupt {
            key: key.to_string(),
            field: name.clone(),
            value: raw.clone(),
        })?,
        None => 0,
    };
    fields.insert(name, (current + 1).to_string());
    Ok(())
}

fn add_float(
    fields: &mut BTreeMap<String, String>,
    key: &str,
    name: String,
    delta: f64,
) -> Result<(), StoreError> {
    let current = match fields.get(&name) {
        Some(raw) => raw.parse::<f64>().map_err(|_| StoreError::Corrupt {
            key: key.to_string(),
            field: name.clone(),
            value: raw.clone(),
        })?,
        None => 0.0,
    };
    fields.insert(name, layout::format_float(current + delta));
    Ok(())
}

#[async_trait]
impl SwapStore for MemoryStore {
    async fn apply_event(&self, event: &SwapEvent, minute: i64) -> Result<bool, StoreError> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let now = Utc::now().timestamp();
        let dedupe_key = layout::dedupe_key(&event.event_id);

        if let Some(&expires_at) = inner.dedupe.get(&dedupe_key) {
            if expires_at > now {
                return Ok(false);
            }
        }

        // Stage the increments on a copy so a corrupt field leaves no trace.
        let series_key = layout::series_key(&event.token);
        let mut fields = inner.series.get(&event.token).cloned().unwrap_or_default();
        add_count(&mut fields, &series_key, layout::field(minute, FieldKind::Count))?;
        add_float(
            &mut fields,
            &series_key,
            layout::field(minute, FieldKind::Usd),
            event.usd_value,
        )?;
        add_float(
            &mut fields,
            &series_key,
            layout::field(minute, FieldKind::Quantity),
            event.amount,
        )?;

        inner
            .dedupe
            .insert(dedupe_key, now.saturating_add(self.dedupe_ttl_secs));
        inner.series.insert(event.token.clone(), fields);
        inner.tokens.insert(event.token.clone());
        inner.applied += 1;
        if inner.applied % CHECKPOINT_EVERY == 0 {
            inner.last_event_id = Some(event.event_id.clone());
        }
        Ok(true)
    }

    async fn load_all_series(&self) -> Result<SeriesSnapshot, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .tokens
            .iter()
            .map(|token| {
                let fields = inner.series.get(token).cloned().unwrap_or_default();
                (token.clone(), fields)
            })
            .collect())
    }

    async fn last_event_id(&self) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.last_event_id.clone())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let now = now.timestamp();
        let mut inner = self.lock()?;
        let before = inner.dedupe.len();
        inner.dedupe.retain(|_, expires_at| *expires_at > now);
        Ok((before - inner.dedupe.len()) as u64)
    }
}

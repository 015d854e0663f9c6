//! SQLite-backed Persistence Gateway
//!
//! The atomic apply-once runs as a single `IMMEDIATE` transaction on one
//! connection guarded by a mutex, so the dedup check, the marker insert,
//! the aggregate increments and the token registration commit together or
//! not at all. Blocking SQLite calls are moved off the async runtime with
//! `spawn_blocking`.
//!
//! Tables mirror the key layout in [`crate::layout`]:
//! - `dedupe(key, expires_at)`: one row per `dedupe:<event_id>` marker
//! - `series(key, field, value)`: one row per `series:<token>` hash field
//! - `token_set(token)`: the token index
//! - `meta(key, value)`: the `lastEventID` checkpoint

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};
use types::swap::SwapEvent;

use crate::layout::{self, FieldKind};
use crate::store::{SeriesSnapshot, StoreError, SwapStore};
use crate::CHECKPOINT_EVERY;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dedupe (
    key        TEXT PRIMARY KEY,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS dedupe_expires_at ON dedupe (expires_at);
CREATE TABLE IF NOT EXISTS series (
    key   TEXT NOT NULL,
    field TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (key, field)
);
CREATE TABLE IF NOT EXISTS token_set (
    token TEXT PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// SQLite implementation of [`SwapStore`].
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    dedupe_ttl_secs: i64,
    applied: Arc<AtomicU64>,
}

impl SqliteStore {
    /// Open (or create) a store at `path`.
    pub fn open(path: impl AsRef<Path>, dedupe_ttl: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        info!(path = %path.as_ref().display(), "Opened SQLite store");
        Self::with_connection(conn, dedupe_ttl)
    }

    /// Open a private in-memory store (contents vanish on drop).
    pub fn open_in_memory(dedupe_ttl: Duration) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, dedupe_ttl)
    }

    fn with_connection(conn: Connection, dedupe_ttl: Duration) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            dedupe_ttl_secs: i64::try_from(dedupe_ttl.as_secs()).unwrap_or(i64::MAX),
            applied: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Round-trip a trivial query; used at boot to fail fast.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            f(&mut *guard)
        })
        .await?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
}

// ── Transaction helpers ─────────────────────────────────────────────

fn read_field(tx: &Transaction<'_>, key: &str, field: &str) -> Result<Option<String>, StoreError> {
    let value = tx
        .query_row(
            "SELECT value FROM series WHERE key = ?1 AND field = ?2",
            params![key, field],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

fn write_field(tx: &Transaction<'_>, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO series (key, field, value) VALUES (?1, ?2, ?3)
         ON CONFLICT (key, field) DO UPDATE SET value = excluded.value",
        params![key, field, value],
    )?;
    Ok(())
}

fn corrupt(key: &str, field: &str, value: String) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        field: field.to_string(),
        value,
    }
}

fn increment_count(tx: &Transaction<'_>, key: &str, field: &str) -> Result<(), StoreError> {
    let current = match read_field(tx, key, field)? {
        Some(raw) => raw.parse::<u64>().map_err(|_| corrupt(key, field, raw))?,
        None => 0,
    };
    write_field(tx, key, field, &(current + 1).to_string())
}

fn increment_float(tx: &Transaction<'_>, key: &str, field: &str, delta: f64) -> Result<(), StoreError> {
    let current = match read_field(tx, key, field)? {
        Some(raw) => raw.parse::<f64>().map_err(|_| corrupt(key, field, raw))?,
        None => 0.0,
    };
    write_field(tx, key, field, &layout::format_float(current + delta))
}

// ── Gateway ─────────────────────────────────────────────────────────

#[async_trait]
impl SwapStore for SqliteStore {
    async fn apply_event(&self, event: &SwapEvent, minute: i64) -> Result<bool, StoreError> {
        let event_id = event.event_id.clone();
        let token = event.token.clone();
        let usd = event.usd_value;
        let quantity = event.amount;
        let ttl = self.dedupe_ttl_secs;
        let applied = Arc::clone(&self.applied);

        self.run(move |conn| {
            let now = Utc::now().timestamp();
            let dedupe_key = layout::dedupe_key(&event_id);
            let series_key = layout::series_key(&token);

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM dedupe WHERE key = ?1 AND expires_at <= ?2",
                params![dedupe_key, now],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO dedupe (key, expires_at) VALUES (?1, ?2)",
                params![dedupe_key, now.saturating_add(ttl)],
            )?;
            if inserted == 0 {
                // Dropping the transaction rolls it back.
                return Ok(false);
            }

            increment_count(&tx, &series_key, &layout::field(minute, FieldKind::Count))?;
            increment_float(&tx, &series_key, &layout::field(minute, FieldKind::Usd), usd)?;
            increment_float(
                &tx,
                &series_key,
                &layout::field(minute, FieldKind::Quantity),
                quantity,
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO token_set (token) VALUES (?1)",
                params![token],
            )?;
            tx.commit()?;

            let total = applied.fetch_add(1, Ordering::Relaxed) + 1;
            if total % CHECKPOINT_EVERY == 0 {
                if let Err(err) = conn.execute(
                    "INSERT INTO meta (key, value) VALUES (?1, ?2)
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                    params![layout::LAST_EVENT_KEY, event_id],
                ) {
                    warn!(error = %err, event_id = %event_id, "Failed to checkpoint last event id");
                }
            }
            Ok(true)
        })
        .await
    }

    async fn load_all_series(&self) -> Result<SeriesSnapshot, StoreError> {
        self.run(|conn| {
            let mut tokens_stmt = conn.prepare("SELECT token FROM token_set ORDER BY token")?;
            let tokens = tokens_stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut fields_stmt = conn.prepare("SELECT field, value FROM series WHERE key = ?1")?;
            let mut snapshot = SeriesSnapshot::new();
            for token in tokens {
                let key = layout::series_key(&token);
                let fields = fields_stmt
                    .query_map(params![key], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<BTreeMap<String, String>, _>>()?;
                snapshot.insert(token, fields);
            }
            debug!(tokens = snapshot.len(), "Loaded series snapshot");
            Ok(snapshot)
        })
        .await
    }

    async fn last_event_id(&self) -> Result<Option<String>, StoreError> {
        self.run(|conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM meta WHERE key = ?1",
                    params![layout::LAST_EVENT_KEY],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let now = now.timestamp();
        self.run(move |conn| {
            let removed = conn.execute("DELETE FROM dedupe WHERE expires_at <= ?1", params![now])?;
            Ok(removed as u64)
        })
        .await
    }
}

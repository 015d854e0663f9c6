use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Dedup markers must outlive the 24h window or a late redelivery could be
/// counted twice.
pub const MIN_DEDUPE_TTL: Duration = Duration::from_secs(24 * 3600);

const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(25 * 3600);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_path: PathBuf,
    pub http_addr: SocketAddr,
    pub dedupe_ttl: Duration,
    /// Set when a configured TTL below the window had to be raised.
    pub dedupe_ttl_raised: bool,
    pub debug: bool,

    // ── Demo producer ──────────────────────────────────────────────
    pub demo_producer: bool,
    pub demo_interval: Duration,

    // ── Queues ─────────────────────────────────────────────────────
    pub event_buffer: usize,
    pub dead_queue_capacity: usize,

    // ── Timers ─────────────────────────────────────────────────────
    pub ws_keepalive: Duration,
    pub dedupe_purge_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("swap_stats.db"),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            dedupe_ttl: DEFAULT_DEDUPE_TTL,
            dedupe_ttl_raised: false,
            debug: false,
            demo_producer: true,
            demo_interval: Duration::from_millis(10),
            event_buffer: 8192,
            dead_queue_capacity: 1024,
            ws_keepalive: Duration::from_secs(60),
            dedupe_purge_interval: Duration::from_secs(3600),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables
    /// take their defaults; malformed numbers fall back to defaults too.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let defaults = Config::default();

        let store_path = get("STORE_PATH").map(PathBuf::from).unwrap_or(defaults.store_path);

        let http_addr = match get("HTTP_ADDR") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                name: "HTTP_ADDR",
                value: raw.clone(),
                reason: "expected host:port",
            })?,
            None => defaults.http_addr,
        };

        let configured_ttl = match get("DEDUPE_TTL") {
            Some(raw) => parse_duration(&raw).ok_or(ConfigError::InvalidValue {
                name: "DEDUPE_TTL",
                value: raw.clone(),
                reason: "expected <n>s, <n>m, <n>h or <n>d",
            })?,
            None => defaults.dedupe_ttl,
        };
        let dedupe_ttl_raised = configured_ttl < MIN_DEDUPE_TTL;
        let dedupe_ttl = configured_ttl.max(MIN_DEDUPE_TTL);

        let number = |name: &str, default: u64| -> u64 {
            get(name).and_then(|s| s.parse().ok()).unwrap_or(default)
        };
        let flag = |name: &str, default: bool| -> bool {
            get(name)
                .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"))
                .unwrap_or(default)
        };

        Ok(Self {
            store_path,
            http_addr,
            dedupe_ttl,
            dedupe_ttl_raised,
            debug: flag("DEBUG", defaults.debug),
            demo_producer: flag("DEMO_PRODUCER", defaults.demo_producer),
            demo_interval: Duration::from_millis(
                number("DEMO_INTERVAL_MS", defaults.demo_interval.as_millis() as u64).max(1),
            ),
            event_buffer: number("EVENT_BUFFER", defaults.event_buffer as u64).max(1) as usize,
            dead_queue_capacity: number(
                "DEAD_QUEUE_CAPACITY",
                defaults.dead_queue_capacity as u64,
            )
            .max(1) as usize,
            ws_keepalive: Duration::from_secs(
                number("WS_KEEPALIVE_SECS", defaults.ws_keepalive.as_secs()).max(2),
            ),
            dedupe_purge_interval: Duration::from_secs(
                number("DEDUPE_PURGE_SECS", defaults.dedupe_purge_interval.as_secs()).max(1),
            ),
        })
    }
}

/// Parse `<n>s`, `<n>m`, `<n>h` or `<n>d`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let unit = raw.chars().last()?;
    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86_400,
        _ => return None,
    };
    let amount: u64 = raw[..raw.len() - 1].parse().ok()?;
    amount.checked_mul(multiplier).map(Duration::from_secs)
}

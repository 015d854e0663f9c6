//! Store key layout and the snapshot field codec
//!
//! The layout is shared with every deployment that has ever written to the
//! store and must not change: a series hash holds one field per minute and
//! aggregate kind, e.g. `"28468712#c" = "3"`, `"28468712#u" = "1500.25"`.

use std::fmt;

/// Key of the last-applied event checkpoint.
pub const LAST_EVENT_KEY: &str = "lastEventID";

const DEDUPE_PREFIX: &str = "dedupe:";
const SERIES_PREFIX: &str = "series:";
const FIELD_SEPARATOR: char = '#';

/// Dedup marker key for an event id.
pub fn dedupe_key(event_id: &str) -> String {
    format!("{DEDUPE_PREFIX}{event_id}")
}

/// Series hash key for a token.
pub fn series_key(token: &str) -> String {
    format!("{SERIES_PREFIX}{token}")
}

/// Aggregate kind stored in a series field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldKind {
    /// Swap count, stored as an unsigned integer
    Count,
    /// USD notional, stored as a float
    Usd,
    /// Token quantity, stored as a float
    Quantity,
}

impl FieldKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            FieldKind::Count => "c",
            FieldKind::Usd => "u",
            FieldKind::Quantity => "q",
        }
    }

    pub fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "c" => Some(FieldKind::Count),
            "u" => Some(FieldKind::Usd),
            "q" => Some(FieldKind::Quantity),
            _ => None,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Series field name for a minute and kind.
pub fn field(minute: i64, kind: FieldKind) -> String {
    format!("{minute}{FIELD_SEPARATOR}{}", kind.suffix())
}

/// Parse a series field name back into its minute and kind.
///
/// Returns `None` for anything that is not exactly `<integer>#<c|u|q>`.
pub fn parse_field(name: &str) -> Option<(i64, FieldKind)> {
    let (minute, kind) = name.split_once(FIELD_SEPARATOR)?;
    if kind.contains(FIELD_SEPARATOR) {
        return None;
    }
    let minute = minute.parse::<i64>().ok()?;
    let kind = FieldKind::from_suffix(kind)?;
    Some((minute, kind))
}

/// Stringify a float the way it is stored (shortest round-trip form).
pub fn format_float(value: f64) -> String {
    value.to_string()
}

//! Tolerant readers for loosely typed SQLite rows.
//!
//! The services write their databases through different ORMs across
//! versions: booleans are 0/1 integers, timestamps show up with a space or a
//! `T`, with or without an offset, with up to seven fractional digits.
//! Columns come and go between releases, so a missing column reads as
//! `None` instead of failing the row.

use sqlx::sqlite::SqliteRow;
use sqlx::{Decode, Row, Sqlite, Type};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

pub(crate) trait RowExt {
    /// Column value, or `None` when the column is NULL, absent, or cannot
    /// be decoded as `T`.
    fn opt<'r, T>(&'r self, column: &str) -> Option<T>
    where
        T: Decode<'r, Sqlite> + Type<Sqlite>;

    /// Non-empty, trimmed text.
    fn text(&self, column: &str) -> Option<String> {
        self.opt::<String>(column).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    }

    /// 0/1 flags; anything missing is `false`.
    fn flag(&self, column: &str) -> bool {
        self.opt::<i64>(column).is_some_and(|v| v != 0)
    }

    fn timestamp(&self, column: &str) -> Option<String> {
        self.opt::<String>(column).as_deref().and_then(timestamp)
    }
}

impl RowExt for SqliteRow {
    fn opt<'r, T>(&'r self, column: &str) -> Option<T>
    where
        T: Decode<'r, Sqlite> + Type<Sqlite>,
    {
        // SQLite columns are dynamically typed: skip sqlx's declared-type
        // check and let SQLite coerce the stored value.
        self.try_get_unchecked::<Option<T>, _>(column).ok().flatten()
    }
}

/// Normalize a timestamp to RFC 3339 in UTC.
///
/// Values without an offset are taken to be UTC. The .NET "zero" date
/// (year 1) means "never" and becomes `None`.
pub(crate) fn timestamp(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut normalized = raw.replacen(' ', "T", 1);
    let (_, time_part) = normalized.split_once('T')?;
    let has_offset = time_part.ends_with(['Z', 'z']) || time_part.contains(['+', '-']);
    if !has_offset {
        normalized.push('Z');
    }
    let parsed = OffsetDateTime::parse(&normalized, &Rfc3339).ok()?;
    if parsed.year() <= 1 {
        return None;
    }
    parsed.to_offset(UtcOffset::UTC).format(&Rfc3339).ok()
}

/// Normalize a calendar date to `YYYY-MM-DD`, accepting full timestamps too.
pub(crate) fn date(raw: &str) -> Option<String> {
    let format = format_description!("[year]-[month]-[day]");
    let head = raw.trim().get(..10)?;
    let parsed = Date::parse(head, &format).ok()?;
    if parsed.year() <= 1 {
        return None;
    }
    parsed.format(&format).ok()
}

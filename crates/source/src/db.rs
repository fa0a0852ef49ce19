//! Read-only access to the services' SQLite databases.

use crate::SourceOptions;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Connection, SqliteConnection};
use std::collections::HashMap;
use std::path::Path;
use tracing::instrument;

use crate::coerce::RowExt;

/// Open `path` read-only, failing with [`ErrorKind::Unavailable`] when the
/// file is missing, locked past the busy timeout, or not a database.
///
/// Each extraction opens its own connection; the owning service keeps
/// writing to the file while we read.
#[instrument(skip(options, path), fields(path = %path.display()))]
pub(crate) async fn open(service: &'static str, path: &Path, options: &SourceOptions) -> Result<SqliteConnection> {
    if !path.is_file() {
        exn::bail!(ErrorKind::Unavailable(format!("{service} database {} does not exist", path.display())));
    }
    let unavailable = || ErrorKind::Unavailable(format!("{service} database {} cannot be opened", path.display()));
    let connect = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .create_if_missing(false)
        .busy_timeout(options.busy_timeout);
    let mut conn = tokio::time::timeout(options.open_timeout, SqliteConnection::connect_with(&connect))
        .await
        .or_raise(unavailable)?
        .or_raise(unavailable)?;
    // Opening is lazy in SQLite: touch the schema so locks and garbage
    // files surface here rather than mid-extraction.
    tokio::time::timeout(options.open_timeout, sqlx::query("SELECT count(*) FROM sqlite_master").fetch_one(&mut conn))
        .await
        .or_raise(unavailable)?
        .or_raise(unavailable)?;
    Ok(conn)
}

pub(crate) async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Unavailable(format!("cannot read schema while looking for {table}")))?;
    Ok(row.is_some())
}

/// Fail with [`ErrorKind::Unavailable`] unless `table` exists.
pub(crate) async fn require_table(conn: &mut SqliteConnection, service: &'static str, table: &str) -> Result<()> {
    if !table_exists(conn, table).await? {
        exn::bail!(ErrorKind::Unavailable(format!("{service} database has no {table} table")));
    }
    Ok(())
}

/// Load an optional lookup table into memory, keyed by an integer column.
///
/// An absent table yields an empty map; only the first row per key is kept.
pub(crate) async fn lookup(
    conn: &mut SqliteConnection,
    service: &'static str,
    table: &str,
    key: &str,
) -> Result<HashMap<i64, SqliteRow>> {
    // Table names come from constants, never from input.
    let sql = format!("SELECT * FROM \"{table}\" ORDER BY rowid");
    lookup_query(conn, service, table, &sql, key).await
}

/// Like [`lookup`], for an arbitrary query over `table` (usually an
/// aggregate grouped by `key`).
pub(crate) async fn lookup_query(
    conn: &mut SqliteConnection,
    service: &'static str,
    table: &str,
    sql: &str,
    key: &str,
) -> Result<HashMap<i64, SqliteRow>> {
    let mut map = HashMap::new();
    if !table_exists(conn, table).await? {
        tracing::debug!(service, table, "Optional table missing");
        return Ok(map);
    }
    let rows = sqlx::query(sql).fetch_all(conn).await.or_raise(|| ErrorKind::Read(service))?;
    for row in rows {
        if let Some(id) = row.opt::<i64>(key) {
            map.entry(id).or_insert(row);
        }
    }
    Ok(map)
}

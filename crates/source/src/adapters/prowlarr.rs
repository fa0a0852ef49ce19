use super::{RecordStream, SourceAdapter, validated};
use crate::SourceOptions;
use crate::coerce::RowExt;
use crate::db;
use crate::error::ErrorKind;
use crate::models::{IndexerConfig, Kind, Record};
use async_stream::stream;
use exn::ResultExt;
use futures::StreamExt;
use sqlx::sqlite::SqliteRow;
use std::path::PathBuf;

const SERVICE: &str = "prowlarr";

/// Indexer definitions from `prowlarr.db`.
///
/// The `Settings` column holds API keys and cookies and is never read.
pub struct ProwlarrIndexers {
    db: PathBuf,
    options: SourceOptions,
}

impl ProwlarrIndexers {
    pub fn new(db: impl Into<PathBuf>, options: SourceOptions) -> Self {
        Self { db: db.into(), options }
    }
}

impl SourceAdapter for ProwlarrIndexers {
    fn kind(&self) -> Kind {
        Kind::Indexers
    }

    fn extract(&self) -> RecordStream<'_> {
        Box::pin(stream!({
            let mut conn = match db::open(SERVICE, &self.db, &self.options).await {
                Ok(conn) => conn,
                Err(e) => {
                    yield Err(e);
                    return;
                },
            };
            if let Err(e) = db::require_table(&mut conn, SERVICE, "Indexers").await {
                yield Err(e);
                return;
            }

            let mut rows = sqlx::query("SELECT * FROM Indexers ORDER BY Id").fetch(&mut conn);
            while let Some(row) = rows.next().await {
                match row.or_raise(|| ErrorKind::Read(SERVICE)) {
                    Ok(row) => {
                        yield Ok(validated(indexer(&row)));
                    },
                    Err(e) => {
                        yield Err(e);
                        return;
                    },
                }
            }
        }))
    }
}

fn indexer(row: &SqliteRow) -> Result<Record, String> {
    let id = row.opt::<i64>("Id").filter(|id| *id > 0).ok_or("indexer row without an id")?;
    let name = row.text("Name").ok_or_else(|| format!("indexer {id} has no name"))?;
    Ok(Record::Indexer(IndexerConfig {
        native_id: id,
        name,
        implementation: row.text("Implementation"),
        config_contract: row.text("ConfigContract"),
        enable: row.flag("Enable"),
        priority: row.opt::<i64>("Priority"),
        app_profile_id: row.opt::<i64>("AppProfileId"),
        added_at: row.timestamp("Added"),
    }))
}

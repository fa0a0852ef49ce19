use super::{RecordStream, SourceAdapter, validated};
use crate::coerce::RowExt;
use crate::db;
use crate::error::{Error, ErrorKind};
use crate::models::{Extracted, Kind, QualityProfile, Record};
use crate::{Layout, SourceOptions};
use async_stream::stream;
use exn::ResultExt;
use futures::StreamExt;
use serde_json::Value;
use sqlx::SqliteConnection;
use sqlx::sqlite::SqliteRow;
use std::path::PathBuf;

/// Quality profiles of every installed *arr service.
///
/// A service whose directory is absent is not installed and contributes
/// nothing. An installed service whose database cannot be read makes the
/// extraction incomplete.
pub struct QualityProfiles {
    sources: Vec<Source>,
    options: SourceOptions,
}

struct Source {
    service: &'static str,
    dir: PathBuf,
    db: PathBuf,
}

impl QualityProfiles {
    pub fn new(layout: &Layout, options: SourceOptions) -> Self {
        let sources = vec![
            Source { service: "radarr", dir: layout.radarr.clone(), db: layout.radarr_db() },
            Source { service: "sonarr", dir: layout.sonarr.clone(), db: layout.sonarr_db() },
        ];
        Self { sources, options }
    }
}

async fn connect(source: &Source, options: &SourceOptions) -> Result<SqliteConnection, Error> {
    let mut conn = db::open(source.service, &source.db, options).await?;
    db::require_table(&mut conn, source.service, "QualityProfiles").await?;
    Ok(conn)
}

impl SourceAdapter for QualityProfiles {
    fn kind(&self) -> Kind {
        Kind::QualityProfiles
    }

    fn extract(&self) -> RecordStream<'_> {
        Box::pin(stream!({
            let mut opened = Vec::new();
            let mut failed = Vec::new();
            for source in self.sources.iter().filter(|s| s.dir.is_dir()) {
                match connect(source, &self.options).await {
                    Ok(conn) => opened.push((source.service, conn)),
                    Err(e) => failed.push((source, e)),
                }
            }
            if opened.is_empty() {
                let err = match failed.into_iter().next() {
                    Some((_, e)) => e.raise(ErrorKind::Unavailable("no quality profiles could be read".to_string())),
                    None => Error::from(ErrorKind::Unavailable("neither radarr nor sonarr is installed".to_string())),
                };
                yield Err(err);
                return;
            }
            for (source, e) in failed {
                tracing::warn!(service = source.service, error = %&*e, "Quality profiles unavailable");
                yield Ok(Extracted::Incomplete { source: source.service.to_string(), reason: (*e).to_string() });
            }

            for (service, mut conn) in opened {
                let mut rows = sqlx::query("SELECT * FROM QualityProfiles ORDER BY Id").fetch(&mut conn);
                while let Some(row) = rows.next().await {
                    match row.or_raise(|| ErrorKind::Read(service)) {
                        Ok(row) => {
                            yield Ok(validated(profile(service, &row)));
                        },
                        Err(e) => {
                            tracing::warn!(service, error = %&*e, "Quality profiles read interrupted");
                            yield Ok(Extracted::Incomplete { source: service.to_string(), reason: (*e).to_string() });
                            break;
                        },
                    }
                }
            }
        }))
    }
}

fn profile(service: &str, row: &SqliteRow) -> Result<Record, String> {
    let id = row.opt::<i64>("Id").ok_or_else(|| format!("{service} profile without an id"))?;
    let name = row.text("Name").ok_or_else(|| format!("{service} profile {id} has no name"))?;
    let items = match row.opt::<String>("Items") {
        Some(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        None => Value::Null,
    };
    Ok(Record::QualityProfile(QualityProfile {
        service_name: service.to_string(),
        profile_id: id,
        name,
        cutoff: row.opt::<i64>("Cutoff"),
        upgrade_allowed: row.flag("UpgradeAllowed"),
        items,
    }))
}

use super::{RecordStream, SourceAdapter, status_name, validated};
use crate::SourceOptions;
use crate::coerce::RowExt;
use crate::db;
use crate::error::{Error, ErrorKind};
use crate::models::{Kind, LibraryItem, LibraryKind, Record};
use async_stream::stream;
use exn::ResultExt;
use futures::StreamExt;
use sqlx::sqlite::SqliteRow;
use std::collections::HashMap;
use std::path::PathBuf;

const SERVICE: &str = "radarr";
const MOVIE_STATUS: [(i64, &str); 5] = [(-1, "deleted"), (0, "tba"), (1, "announced"), (2, "inCinemas"), (3, "released")];

/// Movies from `radarr.db`.
///
/// Newer schemas keep the descriptive columns in `MovieMetadata`; older ones
/// keep them on `Movies` itself. Both are read, metadata first.
pub struct RadarrMovies {
    db: PathBuf,
    options: SourceOptions,
}

impl RadarrMovies {
    pub fn new(db: impl Into<PathBuf>, options: SourceOptions) -> Self {
        Self { db: db.into(), options }
    }
}

struct Lookups {
    metadata: HashMap<i64, SqliteRow>,
    files: HashMap<i64, SqliteRow>,
}

impl SourceAdapter for RadarrMovies {
    fn kind(&self) -> Kind {
        Kind::Movies
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
            let lookups = async {
                db::require_table(&mut conn, SERVICE, "Movies").await?;
                Ok::<_, Error>(Lookups {
                    metadata: db::lookup(&mut conn, SERVICE, "MovieMetadata", "Id").await?,
                    files: db::lookup(&mut conn, SERVICE, "MovieFiles", "MovieId").await?,
                })
            };
            let lookups = match lookups.await {
                Ok(lookups) => lookups,
                Err(e) => {
                    yield Err(e);
                    return;
                },
            };

            let mut rows = sqlx::query("SELECT * FROM Movies ORDER BY Id").fetch(&mut conn);
            while let Some(row) = rows.next().await {
                match row.or_raise(|| ErrorKind::Read(SERVICE)) {
                    Ok(row) => {
                        yield Ok(validated(movie(&row, &lookups)));
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

fn movie(row: &SqliteRow, lookups: &Lookups) -> Result<Record, String> {
    let id = row.opt::<i64>("Id").filter(|id| *id > 0).ok_or("movie row without an id")?;
    let meta = row.opt::<i64>("MovieMetadataId").and_then(|m| lookups.metadata.get(&m));
    let text = |column: &str| meta.and_then(|m| m.text(column)).or_else(|| row.text(column));
    let int = |column: &str| meta.and_then(|m| m.opt::<i64>(column)).or_else(|| row.opt::<i64>(column));

    let title = text("Title").ok_or_else(|| format!("movie {id} has no title"))?;
    let file = lookups.files.get(&id);
    let item = LibraryItem {
        native_id: id,
        title,
        original_title: text("OriginalTitle"),
        year: int("Year").filter(|y| *y > 0),
        tmdb_id: int("TmdbId").filter(|t| *t > 0),
        imdb_id: text("ImdbId"),
        overview: text("Overview"),
        studio: text("Studio"),
        quality_profile_id: row.opt::<i64>("QualityProfileId").or_else(|| row.opt::<i64>("ProfileId")),
        path: row.text("Path"),
        monitored: row.flag("Monitored"),
        status: status_name(text("Status"), &MOVIE_STATUS),
        runtime: int("Runtime"),
        size_on_disk: file.and_then(|f| f.opt::<i64>("Size")),
        has_file: file.is_some() || row.opt::<i64>("MovieFileId").is_some_and(|f| f > 0),
        added_at: row.timestamp("Added"),
        ..LibraryItem::default()
    };
    Ok(Record::Library(LibraryKind::Movie, item))
}

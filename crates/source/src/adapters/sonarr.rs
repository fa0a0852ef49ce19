use super::{RecordStream, SourceAdapter, status_name, validated};
use crate::SourceOptions;
use crate::coerce::{self, RowExt};
use crate::db;
use crate::error::{Error, ErrorKind};
use crate::models::{EpisodeItem, Kind, LibraryItem, LibraryKind, Record};
use async_stream::stream;
use exn::ResultExt;
use futures::StreamExt;
use sqlx::sqlite::SqliteRow;
use std::collections::HashMap;
use std::path::PathBuf;

const SERVICE: &str = "sonarr";
const SERIES_STATUS: [(i64, &str); 4] = [(-1, "deleted"), (0, "continuing"), (1, "ended"), (2, "upcoming")];

const FILE_TOTALS: &str = "SELECT SeriesId, COUNT(*) AS Files, SUM(Size) AS Size FROM EpisodeFiles GROUP BY SeriesId";
const EPISODE_TOTALS: &str = "SELECT SeriesId, COUNT(*) AS Episodes, COUNT(DISTINCT SeasonNumber) AS Seasons \
                              FROM Episodes WHERE SeasonNumber > 0 GROUP BY SeriesId";

/// Series from `sonarr.db`, with counts computed from the episode tables
/// when the series row does not carry them.
pub struct SonarrSeries {
    db: PathBuf,
    options: SourceOptions,
}

impl SonarrSeries {
    pub fn new(db: impl Into<PathBuf>, options: SourceOptions) -> Self {
        Self { db: db.into(), options }
    }
}

struct Totals {
    files: HashMap<i64, SqliteRow>,
    episodes: HashMap<i64, SqliteRow>,
}

impl SourceAdapter for SonarrSeries {
    fn kind(&self) -> Kind {
        Kind::Series
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
            let totals = async {
                db::require_table(&mut conn, SERVICE, "Series").await?;
                Ok::<_, Error>(Totals {
                    files: db::lookup_query(&mut conn, SERVICE, "EpisodeFiles", FILE_TOTALS, "SeriesId").await?,
                    episodes: db::lookup_query(&mut conn, SERVICE, "Episodes", EPISODE_TOTALS, "SeriesId").await?,
                })
            };
            let totals = match totals.await {
                Ok(totals) => totals,
                Err(e) => {
                    yield Err(e);
                    return;
                },
            };

            let mut rows = sqlx::query("SELECT * FROM Series ORDER BY Id").fetch(&mut conn);
            while let Some(row) = rows.next().await {
                match row.or_raise(|| ErrorKind::Read(SERVICE)) {
                    Ok(row) => {
                        yield Ok(validated(series(&row, &totals)));
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

fn series(row: &SqliteRow, totals: &Totals) -> Result<Record, String> {
    let id = row.opt::<i64>("Id").filter(|id| *id > 0).ok_or("series row without an id")?;
    let title = row.text("Title").ok_or_else(|| format!("series {id} has no title"))?;
    let files = totals.files.get(&id);
    let episodes = totals.episodes.get(&id);

    let item = LibraryItem {
        native_id: id,
        title,
        title_slug: row.text("TitleSlug"),
        year: row.opt::<i64>("Year").filter(|y| *y > 0),
        tvdb_id: row.opt::<i64>("TvdbId").filter(|t| *t > 0),
        imdb_id: row.text("ImdbId"),
        overview: row.text("Overview"),
        studio: row.text("Network"),
        quality_profile_id: row.opt::<i64>("QualityProfileId").or_else(|| row.opt::<i64>("ProfileId")),
        path: row.text("Path"),
        monitored: row.flag("Monitored"),
        status: status_name(row.text("Status"), &SERIES_STATUS),
        runtime: row.opt::<i64>("Runtime"),
        season_count: row.opt::<i64>("SeasonCount").or_else(|| episodes.and_then(|e| e.opt::<i64>("Seasons"))),
        episode_count: row.opt::<i64>("EpisodeCount").or_else(|| episodes.and_then(|e| e.opt::<i64>("Episodes"))),
        episode_file_count: row
            .opt::<i64>("EpisodeFileCount")
            .or_else(|| files.and_then(|f| f.opt::<i64>("Files"))),
        size_on_disk: row.opt::<i64>("SizeOnDisk").or_else(|| files.and_then(|f| f.opt::<i64>("Size"))),
        has_file: files.is_some(),
        added_at: row.timestamp("Added"),
        ..LibraryItem::default()
    };
    Ok(Record::Library(LibraryKind::Series, item))
}

/// Episodes from `sonarr.db`. Specials (season 0) are kept.
pub struct SonarrEpisodes {
    db: PathBuf,
    options: SourceOptions,
}

impl SonarrEpisodes {
    pub fn new(db: impl Into<PathBuf>, options: SourceOptions) -> Self {
        Self { db: db.into(), options }
    }
}

impl SourceAdapter for SonarrEpisodes {
    fn kind(&self) -> Kind {
        Kind::Episodes
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
            if let Err(e) = db::require_table(&mut conn, SERVICE, "Episodes").await {
                yield Err(e);
                return;
            }

            let mut rows = sqlx::query("SELECT * FROM Episodes ORDER BY Id").fetch(&mut conn);
            while let Some(row) = rows.next().await {
                match row.or_raise(|| ErrorKind::Read(SERVICE)) {
                    Ok(row) => {
                        yield Ok(validated(episode(&row)));
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

fn episode(row: &SqliteRow) -> Result<Record, String> {
    let id = row.opt::<i64>("Id").filter(|id| *id > 0).ok_or("episode row without an id")?;
    let series = row.opt::<i64>("SeriesId").ok_or_else(|| format!("episode {id} has no series"))?;
    let season = row.opt::<i64>("SeasonNumber").ok_or_else(|| format!("episode {id} has no season number"))?;
    let number = row.opt::<i64>("EpisodeNumber").ok_or_else(|| format!("episode {id} has no episode number"))?;
    let air_date = row
        .opt::<String>("AirDate")
        .as_deref()
        .and_then(coerce::date)
        .or_else(|| row.opt::<String>("AirDateUtc").as_deref().and_then(coerce::date));

    Ok(Record::Episode(EpisodeItem {
        native_id: id,
        series_native_id: series,
        season_number: season,
        episode_number: number,
        absolute_episode_number: row.opt::<i64>("AbsoluteEpisodeNumber").filter(|n| *n > 0),
        title: row.text("Title"),
        air_date,
        monitored: row.flag("Monitored"),
        has_file: row.opt::<i64>("EpisodeFileId").is_some_and(|f| f > 0),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fixtures;
    use crate::models::Extracted;
    use futures::TryStreamExt;
    use std::ops::Deref;

    const SCHEMA: [&str; 3] = [
        "CREATE TABLE Series (Id INTEGER PRIMARY KEY, TvdbId INTEGER, Title TEXT, TitleSlug TEXT, Year INTEGER, \
         Network TEXT, Status INTEGER, Monitored INTEGER, Path TEXT, QualityProfileId INTEGER, Added TEXT)",
        "CREATE TABLE Episodes (Id INTEGER PRIMARY KEY, SeriesId INTEGER, SeasonNumber INTEGER, EpisodeNumber INTEGER, \
         AbsoluteEpisodeNumber INTEGER, Title TEXT, AirDate TEXT, AirDateUtc TEXT, Monitored INTEGER, EpisodeFileId INTEGER)",
        "CREATE TABLE EpisodeFiles (Id INTEGER PRIMARY KEY, SeriesId INTEGER, SeasonNumber INTEGER, Size INTEGER)",
    ];

    async fn database(dir: &tempfile::TempDir, rows: &[&'static str]) -> PathBuf {
        let mut statements = SCHEMA.to_vec();
        statements.extend_from_slice(rows);
        fixtures::database(dir.path().join("sonarr.db"), &statements).await
    }

    #[tokio::test]
    async fn test_series_counts_are_computed_from_episodes() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir, &[
            "INSERT INTO Series VALUES (1, 81189, 'Breaking Bad', 'breaking-bad', 2008, 'AMC', 1, 1, '/tv/bb', 2, '2022-01-02 03:04:05')",
            "INSERT INTO Episodes VALUES (10, 1, 0, 1, NULL, 'Special', NULL, NULL, 0, 0)",
            "INSERT INTO Episodes VALUES (11, 1, 1, 1, 1, 'Pilot', '2008-01-20', NULL, 1, 100)",
            "INSERT INTO Episodes VALUES (12, 1, 1, 2, 2, 'Cat''s in the Bag', '2008-01-27', NULL, 1, 101)",
            "INSERT INTO Episodes VALUES (13, 1, 2, 1, 8, 'Seven Thirty-Seven', NULL, '2009-03-08T02:00:00Z', 1, 0)",
            "INSERT INTO EpisodeFiles VALUES (100, 1, 1, 1000)",
            "INSERT INTO EpisodeFiles VALUES (101, 1, 1, 2000)",
        ])
        .await;

        let items: Vec<Extracted> =
            SonarrSeries::new(db, SourceOptions::default()).extract().try_collect().await.unwrap();
        let [Extracted::Record(Record::Library(LibraryKind::Series, series))] = items.as_slice() else {
            panic!("unexpected extraction: {items:?}");
        };
        assert_eq!(series.title, "Breaking Bad");
        assert_eq!(series.studio.as_deref(), Some("AMC"));
        assert_eq!(series.status.as_deref(), Some("ended"));
        assert_eq!(series.season_count, Some(2));
        assert_eq!(series.episode_count, Some(3));
        assert_eq!(series.episode_file_count, Some(2));
        assert_eq!(series.size_on_disk, Some(3000));
        assert_eq!(series.added_at.as_deref(), Some("2022-01-02T03:04:05Z"));
    }

    #[tokio::test]
    async fn test_episodes_keep_specials_and_fall_back_to_utc_air_date() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir, &[
            "INSERT INTO Episodes VALUES (10, 1, 0, 1, NULL, 'Special', NULL, NULL, 0, 0)",
            "INSERT INTO Episodes VALUES (13, 1, 2, 1, 8, 'Seven Thirty-Seven', NULL, '2009-03-08T02:00:00Z', 1, 55)",
            "INSERT INTO Episodes (Id, SeriesId, EpisodeNumber) VALUES (14, 1, 2)",
        ])
        .await;

        let items: Vec<Extracted> =
            SonarrEpisodes::new(db, SourceOptions::default()).extract().try_collect().await.unwrap();
        assert_eq!(items.len(), 3);
        let Extracted::Record(Record::Episode(special)) = &items[0] else {
            panic!("unexpected extraction: {:?}", items[0]);
        };
        assert_eq!(special.season_number, 0);
        assert!(!special.has_file);
        let Extracted::Record(Record::Episode(episode)) = &items[1] else {
            panic!("unexpected extraction: {:?}", items[1]);
        };
        assert_eq!(episode.air_date.as_deref(), Some("2009-03-08"));
        assert_eq!(episode.absolute_episode_number, Some(8));
        assert!(episode.has_file);
        assert!(matches!(&items[2], Extracted::Skipped { reason } if reason.contains("season")));
    }

    #[tokio::test]
    async fn test_missing_series_table_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let db = fixtures::database(dir.path().join("sonarr.db"), &["CREATE TABLE Config (Key TEXT)"]).await;
        let adapter = SonarrSeries::new(db, SourceOptions::default());
        let mut stream = adapter.extract();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err.deref(), ErrorKind::Unavailable(_)));
        assert!(stream.next().await.is_none());
    }
}

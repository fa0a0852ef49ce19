//! Canonical records, independent of any source schema.

use derive_more::Display;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::str::FromStr;

/// One row payload, column name to JSON value.
pub type Row = Map<String, Value>;

/// A category of records, reconciled independently of the others.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    #[display("movies")]
    Movies,
    #[display("series")]
    Series,
    #[display("episodes")]
    Episodes,
    #[display("indexers")]
    Indexers,
    #[display("users")]
    Users,
    #[display("service_configs")]
    ServiceConfigs,
    #[display("quality_profiles")]
    QualityProfiles,
}

impl Kind {
    /// Every kind, in the order a run processes them.
    pub const ALL: [Kind; 7] = [
        Kind::Movies,
        Kind::Series,
        Kind::Episodes,
        Kind::Indexers,
        Kind::Users,
        Kind::ServiceConfigs,
        Kind::QualityProfiles,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Movies => "movies",
            Self::Series => "series",
            Self::Episodes => "episodes",
            Self::Indexers => "indexers",
            Self::Users => "jellyfin_users",
            Self::ServiceConfigs => "service_configs",
            Self::QualityProfiles => "quality_profiles",
        }
    }

    /// Natural key columns, `device_id` excluded.
    pub fn key_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Movies => &["radarr_id"],
            Self::Series => &["sonarr_id"],
            Self::Episodes => &["sonarr_episode_id"],
            Self::Indexers => &["prowlarr_id"],
            Self::Users => &["jellyfin_user_id"],
            Self::ServiceConfigs => &["service_name", "config_type"],
            Self::QualityProfiles => &["service_name", "profile_id"],
        }
    }

    /// Column of the run summary holding this kind's upsert count.
    pub fn count_column(&self) -> &'static str {
        match self {
            Self::Movies => "movies_count",
            Self::Series => "series_count",
            Self::Episodes => "episodes_count",
            Self::Indexers => "indexers_count",
            Self::Users => "users_count",
            Self::ServiceConfigs => "configs_count",
            Self::QualityProfiles => "profiles_count",
        }
    }
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Kind::ALL.into_iter().find(|k| k.to_string() == s).ok_or_else(|| format!("unknown kind: {s}"))
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum LibraryKind {
    #[display("movie")]
    Movie,
    #[display("series")]
    Series,
}

/// A movie (Radarr) or a series (Sonarr).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LibraryItem {
    pub native_id: i64,
    pub title: String,
    pub original_title: Option<String>,
    pub title_slug: Option<String>,
    pub year: Option<i64>,
    pub tmdb_id: Option<i64>,
    pub imdb_id: Option<String>,
    pub tvdb_id: Option<i64>,
    pub overview: Option<String>,
    /// Studio for movies, network for series.
    pub studio: Option<String>,
    pub quality_profile_id: Option<i64>,
    pub path: Option<String>,
    pub monitored: bool,
    pub status: Option<String>,
    pub runtime: Option<i64>,
    pub size_on_disk: Option<i64>,
    pub has_file: bool,
    pub season_count: Option<i64>,
    pub episode_count: Option<i64>,
    pub episode_file_count: Option<i64>,
    pub added_at: Option<String>,
}

impl LibraryItem {
    fn movie_row(&self) -> Row {
        object(json!({
            "radarr_id": self.native_id,
            "title": self.title,
            "original_title": self.original_title,
            "year": self.year,
            "tmdb_id": self.tmdb_id,
            "imdb_id": self.imdb_id,
            "overview": self.overview,
            "studio": self.studio,
            "quality_profile_id": self.quality_profile_id,
            "path": self.path,
            "monitored": self.monitored,
            "status": self.status,
            "runtime": self.runtime,
            "has_file": self.has_file,
            "file_size": self.size_on_disk,
            "added_at": self.added_at,
        }))
    }

    fn series_row(&self) -> Row {
        object(json!({
            "sonarr_id": self.native_id,
            "title": self.title,
            "title_slug": self.title_slug,
            "year": self.year,
            "tvdb_id": self.tvdb_id,
            "imdb_id": self.imdb_id,
            "overview": self.overview,
            "network": self.studio,
            "quality_profile_id": self.quality_profile_id,
            "path": self.path,
            "monitored": self.monitored,
            "status": self.status,
            "runtime": self.runtime,
            "season_count": self.season_count,
            "episode_count": self.episode_count,
            "episode_file_count": self.episode_file_count,
            "size_on_disk": self.size_on_disk,
            "added_at": self.added_at,
        }))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EpisodeItem {
    #[serde(rename = "sonarr_episode_id")]
    pub native_id: i64,
    #[serde(rename = "sonarr_series_id")]
    pub series_native_id: i64,
    pub season_number: i64,
    pub episode_number: i64,
    pub absolute_episode_number: Option<i64>,
    pub title: Option<String>,
    pub air_date: Option<String>,
    pub monitored: bool,
    pub has_file: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexerConfig {
    #[serde(rename = "prowlarr_id")]
    pub native_id: i64,
    pub name: String,
    pub implementation: Option<String>,
    pub config_contract: Option<String>,
    pub enable: bool,
    pub priority: Option<i64>,
    pub app_profile_id: Option<i64>,
    pub added_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserAccount {
    #[serde(rename = "jellyfin_user_id")]
    pub native_id: String,
    pub username: String,
    pub is_administrator: bool,
    pub is_disabled: bool,
    pub last_login_at: Option<String>,
    pub last_activity_at: Option<String>,
}

/// Opaque configuration payload. Only the envelope is validated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceConfigBlob {
    pub service_name: String,
    pub config_type: String,
    pub config_data: Value,
    /// BLAKE3 of the serialized payload, for spotting changes across runs.
    pub checksum: String,
}

impl ServiceConfigBlob {
    pub fn new(service_name: impl Into<String>, config_type: impl Into<String>, config_data: Value) -> Self {
        let checksum = blake3::hash(config_data.to_string().as_bytes()).to_hex().to_string();
        Self { service_name: service_name.into(), config_type: config_type.into(), config_data, checksum }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityProfile {
    pub service_name: String,
    pub profile_id: i64,
    pub name: String,
    pub cutoff: Option<i64>,
    pub upgrade_allowed: bool,
    pub items: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Library(LibraryKind, LibraryItem),
    Episode(EpisodeItem),
    Indexer(IndexerConfig),
    User(UserAccount),
    ServiceConfig(ServiceConfigBlob),
    QualityProfile(QualityProfile),
}

impl Record {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Library(LibraryKind::Movie, _) => Kind::Movies,
            Self::Library(LibraryKind::Series, _) => Kind::Series,
            Self::Episode(_) => Kind::Episodes,
            Self::Indexer(_) => Kind::Indexers,
            Self::User(_) => Kind::Users,
            Self::ServiceConfig(_) => Kind::ServiceConfigs,
            Self::QualityProfile(_) => Kind::QualityProfiles,
        }
    }

    /// The row sent to the remote store, without `device_id`.
    ///
    /// Every row of a kind carries the same columns (nulls included), and no
    /// per-run timestamps, so unchanged sources produce identical rows.
    pub fn to_row(&self) -> Row {
        match self {
            Self::Library(LibraryKind::Movie, item) => item.movie_row(),
            Self::Library(LibraryKind::Series, item) => item.series_row(),
            Self::Episode(item) => serialize(item),
            Self::Indexer(item) => serialize(item),
            Self::User(item) => serialize(item),
            Self::ServiceConfig(item) => serialize(item),
            Self::QualityProfile(item) => serialize(item),
        }
    }
}

/// One item of an extraction stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Record(Record),
    /// A source row failed validation and was left out.
    Skipped { reason: String },
    /// One part of a composite source could not be read, so the records of
    /// this extraction are not the complete set.
    Incomplete { source: String, reason: String },
}

fn serialize(value: &impl Serialize) -> Row {
    serde_json::to_value(value).map(object).unwrap_or_default()
}

fn object(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

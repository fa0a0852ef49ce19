//! Source adapters for the media stack.
//!
//! Each adapter reads one kind of record from the local services (Radarr,
//! Sonarr, Prowlarr, Jellyfin and a few config files) and yields canonical
//! [`Record`](models::Record)s as a lazy stream. Databases are opened
//! read-only on every extraction.

pub mod adapters;
mod coerce;
mod db;
pub mod error;
pub mod models;

pub use crate::adapters::{AdapterHandle, RecordStream, SourceAdapter};
pub use crate::models::{Extracted, Kind, Record};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Directory of every service of the media stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub radarr: PathBuf,
    pub sonarr: PathBuf,
    pub prowlarr: PathBuf,
    pub jellyfin: PathBuf,
    pub decypharr: PathBuf,
    pub jellyseerr: PathBuf,
}

impl Layout {
    /// The conventional layout: one directory per service under `root`.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            radarr: root.join("radarr"),
            sonarr: root.join("sonarr"),
            prowlarr: root.join("prowlarr"),
            jellyfin: root.join("jellyfin"),
            decypharr: root.join("decypharr"),
            jellyseerr: root.join("jellyseerr"),
        }
    }

    pub fn radarr_db(&self) -> PathBuf {
        self.radarr.join("radarr.db")
    }

    pub fn sonarr_db(&self) -> PathBuf {
        self.sonarr.join("sonarr.db")
    }

    pub fn prowlarr_db(&self) -> PathBuf {
        self.prowlarr.join("prowlarr.db")
    }

    pub fn jellyfin_db(&self) -> PathBuf {
        self.jellyfin.join("data").join("data").join("jellyfin.db")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOptions {
    /// Upper bound for opening one database.
    pub open_timeout: Duration,
    /// How long SQLite waits on a lock held by the owning service.
    pub busy_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self { open_timeout: Duration::from_secs(5), busy_timeout: Duration::from_millis(1500) }
    }
}

/// One adapter per [`Kind`], in [`Kind::ALL`] order.
pub fn default_adapters(layout: &Layout, options: SourceOptions) -> Vec<AdapterHandle> {
    use crate::adapters::*;
    vec![
        Arc::new(RadarrMovies::new(layout.radarr_db(), options)),
        Arc::new(SonarrSeries::new(layout.sonarr_db(), options)),
        Arc::new(SonarrEpisodes::new(layout.sonarr_db(), options)),
        Arc::new(ProwlarrIndexers::new(layout.prowlarr_db(), options)),
        Arc::new(JellyfinUsers::new(&layout.jellyfin, options)),
        Arc::new(ServiceConfigs::new(layout)),
        Arc::new(QualityProfiles::new(layout, options)),
    ]
}

//! Source adapter trait and implementations.
//!
//! An adapter knows where one kind of record lives and how to project the
//! service's own schema onto the canonical [`Record`]. Extraction is lazy and
//! restartable: every call to [`SourceAdapter::extract()`] opens the source
//! again and streams it from the start.

mod configs;
mod jellyfin;
mod profiles;
mod prowlarr;
mod radarr;
mod sonarr;

pub use self::configs::ServiceConfigs;
pub use self::jellyfin::JellyfinUsers;
pub use self::profiles::QualityProfiles;
pub use self::prowlarr::ProwlarrIndexers;
pub use self::radarr::RadarrMovies;
pub use self::sonarr::{SonarrEpisodes, SonarrSeries};
use crate::error::Result;
use crate::models::{Extracted, Kind, Record};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

pub type RecordStream<'a> = Pin<Box<dyn Stream<Item = Result<Extracted>> + Send + 'a>>;
pub type AdapterHandle = Arc<dyn SourceAdapter + Send + Sync>;

/// Unified interface for local data sources.
///
/// # Stream contract
/// - If the source cannot be opened at all, the **first** item is an error
///   with [`ErrorKind::Unavailable`](crate::error::ErrorKind::Unavailable)
///   and the stream ends.
/// - Rows that fail validation are yielded as [`Extracted::Skipped`].
/// - Composite sources yield [`Extracted::Incomplete`] for each part that
///   could not be read.
/// - An error after the first item means the stream ended early and the
///   records seen so far are not the full set.
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> Kind;

    fn extract(&self) -> RecordStream<'_>;
}

/// A failed validation becomes a skip, not an error.
pub(crate) fn validated(result: std::result::Result<Record, String>) -> Extracted {
    match result {
        Ok(record) => Extracted::Record(record),
        Err(reason) => {
            tracing::debug!(reason = %reason, "Skipping invalid source row");
            Extracted::Skipped { reason }
        },
    }
}

/// Map a numeric status enum to its name, keeping text values as they are.
pub(crate) fn status_name(raw: Option<String>, names: &[(i64, &str)]) -> Option<String> {
    let raw = raw?;
    match raw.parse::<i64>() {
        Ok(value) => Some(names.iter().find(|(v, _)| *v == value).map_or(raw, |(_, name)| name.to_string())),
        Err(_) => Some(raw),
    }
}

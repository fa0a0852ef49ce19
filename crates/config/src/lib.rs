//! Configuration for supabazarr.
//!
//! Layers, lowest priority first:
//! 1. built-in defaults ([`Config::default()`]),
//! 2. a TOML, YAML or JSON file (format chosen by extension),
//! 3. the legacy environment variables (`SUPABASE_URL`, `SUPABASE_SERVICE_KEY`,
//!    `SUPABASE_SCHEMA`, `MEDIA_STACK_PATH`, `DEVICE_UUID`, `HOSTNAME`),
//! 4. `SUPABAZARR_*` environment variables, `__` separating nested keys
//!    (`SUPABAZARR_REMOTE__BATCH_SIZE=200`).

pub mod error;
mod load;
mod secret;

pub use crate::secret::Secret;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MEDIA_STACK_ROOT: &str = "/home/maison/media-stack";
pub const DEFAULT_IDENTITY_FILE: &str = "/etc/supabazarr/device_uuid";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub sources: SourcesConfig,
    pub device: DeviceConfig,
    pub run: RunConfig,
}

/// Connection settings for the PostgREST-compatible remote store.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Project URL, without the `/rest/v1` suffix.
    pub url: String,
    /// Service-role key, sent both as `apikey` and as a bearer token.
    pub service_key: Secret,
    /// Optional schema selected through the `Accept-Profile` and
    /// `Content-Profile` headers.
    pub schema: Option<String>,
    pub timeout_secs: u64,
    /// Maximum rows per upsert or delete request.
    pub batch_size: usize,
    pub retry: RetryConfig,
}
impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            service_key: Secret::default(),
            schema: None,
            timeout_secs: 30,
            batch_size: 500,
            retry: RetryConfig::default(),
        }
    }
}
impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Exponential backoff for transient remote failures.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per request, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}
impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay_ms: 500, max_delay_ms: 30_000, jitter: true }
    }
}

/// Where the local services keep their databases and config files.
///
/// Every service directory defaults to `<root>/<service>`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub root: PathBuf,
    pub radarr: Option<PathBuf>,
    pub sonarr: Option<PathBuf>,
    pub prowlarr: Option<PathBuf>,
    pub jellyfin: Option<PathBuf>,
    pub decypharr: Option<PathBuf>,
    pub jellyseerr: Option<PathBuf>,
    /// Upper bound for opening one local database.
    pub open_timeout_ms: u64,
    /// SQLite `busy_timeout` while the owning service holds a write lock.
    pub busy_timeout_ms: u64,
}
impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_MEDIA_STACK_ROOT),
            radarr: None,
            sonarr: None,
            prowlarr: None,
            jellyfin: None,
            decypharr: None,
            jellyseerr: None,
            open_timeout_ms: 5_000,
            busy_timeout_ms: 1_500,
        }
    }
}
impl SourcesConfig {
    fn dir(&self, name: &str, configured: Option<&PathBuf>) -> PathBuf {
        configured.cloned().unwrap_or_else(|| self.root.join(name))
    }

    pub fn radarr_dir(&self) -> PathBuf {
        self.dir("radarr", self.radarr.as_ref())
    }

    pub fn sonarr_dir(&self) -> PathBuf {
        self.dir("sonarr", self.sonarr.as_ref())
    }

    pub fn prowlarr_dir(&self) -> PathBuf {
        self.dir("prowlarr", self.prowlarr.as_ref())
    }

    pub fn jellyfin_dir(&self) -> PathBuf {
        self.dir("jellyfin", self.jellyfin.as_ref())
    }

    pub fn decypharr_dir(&self) -> PathBuf {
        self.dir("decypharr", self.decypharr.as_ref())
    }

    pub fn jellyseerr_dir(&self) -> PathBuf {
        self.dir("jellyseerr", self.jellyseerr.as_ref())
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// File holding the persisted device identifier.
    pub identity_file: PathBuf,
    /// Pins the device identifier instead of reading `identity_file`.
    pub id: Option<String>,
    pub hostname: Option<String>,
}
impl Default for DeviceConfig {
    fn default() -> Self {
        Self { identity_file: PathBuf::from(DEFAULT_IDENTITY_FILE), id: None, hostname: None }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    /// Skip the high-volume episodes kind.
    pub light_mode: bool,
    /// How many kinds may be extracted and reconciled at the same time.
    pub concurrency: usize,
    /// Allow an empty extraction to delete every remote row of a kind.
    pub allow_empty_wipe: bool,
    /// Delay between runs when not started with `--once`.
    pub interval_hours: u64,
}
impl Default for RunConfig {
    fn default() -> Self {
        Self { light_mode: false, concurrency: 1, allow_empty_wipe: false, interval_hours: 24 }
    }
}
impl RunConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.saturating_mul(3600))
    }
}

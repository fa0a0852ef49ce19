use crate::Config;
use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::value::Uncased;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "SUPABAZARR_";
const LEGACY_ENV: [&str; 6] =
    ["SUPABASE_URL", "SUPABASE_SERVICE_KEY", "SUPABASE_SCHEMA", "MEDIA_STACK_PATH", "DEVICE_UUID", "HOSTNAME"];

impl Config {
    /// Load and validate the configuration.
    ///
    /// An explicit `path` must exist. Without one, `config.toml` in the
    /// platform configuration directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Config = Self::figment(path)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    /// The merged provider stack, before extraction.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        let file = match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => default_path().filter(|p| p.is_file()),
        };
        if let Some(file) = file {
            tracing::debug!(path = %file.display(), "Loading configuration file");
            figment = match file.extension().and_then(|e| e.to_str()) {
                Some("toml") => figment.merge(Toml::file(&file)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(&file)),
                Some("json") => figment.merge(Json::file(&file)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(file)),
            };
        }
        Ok(figment.merge(legacy_env()).merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let url = self.remote.url.trim();
        if url.is_empty() {
            exn::bail!(ErrorKind::Invalid("remote.url", "must be set".to_string()));
        }
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            exn::bail!(ErrorKind::Invalid("remote.url", format!("not an HTTP(S) URL: {url}")));
        }
        if self.remote.service_key.is_empty() {
            exn::bail!(ErrorKind::Invalid("remote.service_key", "must be set".to_string()));
        }
        if self.remote.batch_size == 0 {
            exn::bail!(ErrorKind::Invalid("remote.batch_size", "must be at least 1".to_string()));
        }
        if self.remote.retry.max_attempts == 0 {
            exn::bail!(ErrorKind::Invalid("remote.retry.max_attempts", "must be at least 1".to_string()));
        }
        if self.remote.retry.base_delay_ms > self.remote.retry.max_delay_ms {
            exn::bail!(ErrorKind::Invalid(
                "remote.retry.base_delay_ms",
                "must not exceed remote.retry.max_delay_ms".to_string()
            ));
        }
        if self.run.concurrency == 0 {
            exn::bail!(ErrorKind::Invalid("run.concurrency", "must be at least 1".to_string()));
        }
        if self.run.interval_hours == 0 {
            exn::bail!(ErrorKind::Invalid("run.interval_hours", "must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "supabazarr").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Environment variables understood by earlier deployments of the service.
fn legacy_env() -> Env {
    Env::raw().only(&LEGACY_ENV).map(|key| {
        let mapped = match key.as_str().to_ascii_uppercase().as_str() {
            "SUPABASE_URL" => "remote.url",
            "SUPABASE_SERVICE_KEY" => "remote.service_key",
            "SUPABASE_SCHEMA" => "remote.schema",
            "MEDIA_STACK_PATH" => "sources.root",
            "DEVICE_UUID" => "device.id",
            _ => "device.hostname",
        };
        Uncased::from(mapped)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;
    use std::ops::Deref;

    const MINIMAL: &str = r#"
        [remote]
        url = "https://project.supabase.co"
        service_key = "service-role"
    "#;

    #[test]
    fn test_defaults_and_file() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", MINIMAL)?;
            let config = Config::load(Some(Path::new("config.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.remote.url, "https://project.supabase.co");
            assert_eq!(config.remote.service_key.expose(), "service-role");
            assert_eq!(config.remote.batch_size, 500);
            assert_eq!(config.remote.retry.max_attempts, 5);
            assert_eq!(config.sources.root, PathBuf::from("/home/maison/media-stack"));
            assert_eq!(config.sources.radarr_dir(), PathBuf::from("/home/maison/media-stack/radarr"));
            assert_eq!(config.device.identity_file, PathBuf::from("/etc/supabazarr/device_uuid"));
            assert!(!config.run.light_mode);
            Ok(())
        });
    }

    #[test]
    fn test_prefixed_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", MINIMAL)?;
            jail.set_env("SUPABAZARR_REMOTE__BATCH_SIZE", "200");
            jail.set_env("SUPABAZARR_RUN__LIGHT_MODE", "true");
            jail.set_env("SUPABAZARR_SOURCES__SONARR", "/srv/sonarr");
            let config = Config::load(Some(Path::new("config.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.remote.batch_size, 200);
            assert!(config.run.light_mode);
            assert_eq!(config.sources.sonarr_dir(), PathBuf::from("/srv/sonarr"));
            Ok(())
        });
    }

    #[test]
    fn test_legacy_env_variables() {
        Jail::expect_with(|jail| {
            jail.create_file("config.yaml", "run:\n  concurrency: 2\n")?;
            jail.set_env("SUPABASE_URL", "https://legacy.supabase.co");
            jail.set_env("SUPABASE_SERVICE_KEY", "legacy-key");
            jail.set_env("MEDIA_STACK_PATH", "/opt/stack");
            let config = Config::load(Some(Path::new("config.yaml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.remote.url, "https://legacy.supabase.co");
            assert_eq!(config.remote.service_key.expose(), "legacy-key");
            assert_eq!(config.sources.jellyfin_dir(), PathBuf::from("/opt/stack/jellyfin"));
            assert_eq!(config.run.concurrency, 2);
            Ok(())
        });
    }

    #[test]
    fn test_prefixed_env_beats_legacy_env() {
        Jail::expect_with(|jail| {
            jail.create_file("config.json", r#"{"remote": {"service_key": "from-file"}}"#)?;
            jail.set_env("SUPABASE_URL", "https://legacy.supabase.co");
            jail.set_env("SUPABAZARR_REMOTE__URL", "https://new.supabase.co");
            let config = Config::load(Some(Path::new("config.json"))).map_err(|e| e.to_string())?;
            assert_eq!(config.remote.url, "https://new.supabase.co");
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        Jail::expect_with(|_jail| {
            let err = Config::load(Some(Path::new("nope.toml"))).unwrap_err();
            assert!(matches!(err.deref(), ErrorKind::NotFound(_)));
            Ok(())
        });
    }

    #[test]
    fn test_unsupported_extension() {
        Jail::expect_with(|jail| {
            jail.create_file("config.ini", "url = nope")?;
            let err = Config::load(Some(Path::new("config.ini"))).unwrap_err();
            assert!(matches!(err.deref(), ErrorKind::UnsupportedFormat(_)));
            Ok(())
        });
    }

    #[rstest]
    #[case("remote.url", Config { remote: crate::RemoteConfig { url: String::new(), ..valid().remote }, ..valid() })]
    #[case("remote.url", Config { remote: crate::RemoteConfig { url: "ftp://x".to_string(), ..valid().remote }, ..valid() })]
    #[case("remote.service_key", Config { remote: crate::RemoteConfig { service_key: crate::Secret::default(), ..valid().remote }, ..valid() })]
    #[case("remote.batch_size", Config { remote: crate::RemoteConfig { batch_size: 0, ..valid().remote }, ..valid() })]
    #[case("run.concurrency", Config { run: crate::RunConfig { concurrency: 0, ..valid().run }, ..valid() })]
    #[case("run.interval_hours", Config { run: crate::RunConfig { interval_hours: 0, ..valid().run }, ..valid() })]
    fn test_validation_rejects(#[case] field: &str, #[case] config: Config) {
        let err = config.validate().unwrap_err();
        match err.deref() {
            ErrorKind::Invalid(name, _) => assert_eq!(*name, field),
            other => panic!("unexpected error: {other}"),
        }
    }

    fn valid() -> Config {
        let mut config = Config::default();
        config.remote.url = "https://project.supabase.co".to_string();
        config.remote.service_key = "key".into();
        config
    }

    #[test]
    fn test_valid_config_passes() {
        valid().validate().unwrap();
    }
}

use super::{RecordStream, SourceAdapter};
use crate::Layout;
use crate::error::{Error, ErrorKind, Result};
use crate::models::{Extracted, Kind, Record, ServiceConfigBlob};
use async_stream::stream;
use exn::ResultExt;
use quick_xml::Reader;
use quick_xml::events::Event;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};

const MASK: &str = "***MASKED***";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    /// A flat XML document: one element per setting under the root.
    Xml,
    Json,
    /// Decypharr's JSON, with debrid keys and arr tokens masked.
    Decypharr,
}

#[derive(Debug, Clone)]
struct ConfigFile {
    service: &'static str,
    config_type: &'static str,
    /// Service directory; when it is absent the service is not installed.
    dir: PathBuf,
    /// Where the file may live, in order of preference.
    candidates: Vec<PathBuf>,
    format: Format,
    required: bool,
}

/// Configuration files of every installed service, stored as opaque JSON
/// payloads keyed by `(service_name, config_type)`.
pub struct ServiceConfigs {
    files: Vec<ConfigFile>,
}

impl ServiceConfigs {
    pub fn new(layout: &Layout) -> Self {
        let mut files = Vec::new();
        for (service, dir) in [("radarr", &layout.radarr), ("sonarr", &layout.sonarr), ("prowlarr", &layout.prowlarr)] {
            files.push(ConfigFile {
                service,
                config_type: "config",
                dir: dir.clone(),
                candidates: vec![dir.join("config.xml")],
                format: Format::Xml,
                required: true,
            });
        }
        for (config_type, required) in [("system", true), ("network", false), ("encoding", false)] {
            let name = format!("{config_type}.xml");
            files.push(ConfigFile {
                service: "jellyfin",
                config_type,
                dir: layout.jellyfin.clone(),
                candidates: vec![layout.jellyfin.join("config").join(&name), layout.jellyfin.join(&name)],
                format: Format::Xml,
                required,
            });
        }
        files.push(ConfigFile {
            service: "decypharr",
            config_type: "config",
            dir: layout.decypharr.clone(),
            candidates: vec![layout.decypharr.join("config.json")],
            format: Format::Decypharr,
            required: true,
        });
        files.push(ConfigFile {
            service: "jellyseerr",
            config_type: "settings",
            dir: layout.jellyseerr.clone(),
            candidates: vec![layout.jellyseerr.join("config").join("settings.json"), layout.jellyseerr.join("settings.json")],
            format: Format::Json,
            required: true,
        });
        Self { files }
    }
}

impl SourceAdapter for ServiceConfigs {
    fn kind(&self) -> Kind {
        Kind::ServiceConfigs
    }

    fn extract(&self) -> RecordStream<'_> {
        Box::pin(stream!({
            // Files are small; read them all first so that "nothing readable"
            // can still be reported as the first item.
            let mut items = Vec::new();
            let mut first_error: Option<Error> = None;
            let mut read = 0usize;
            for file in self.files.iter().filter(|f| f.dir.is_dir()) {
                let outcome = match file.candidates.iter().find(|p| p.is_file()) {
                    Some(path) => read_config(file, path).await.map(Some),
                    None if file.required => Err(Error::from(ErrorKind::Unavailable(format!(
                        "{} is installed but has no {}",
                        file.service,
                        file.candidates[0].display()
                    )))),
                    None => Ok(None),
                };
                match outcome {
                    Ok(Some(blob)) => {
                        read += 1;
                        items.push(Extracted::Record(Record::ServiceConfig(blob)));
                    },
                    Ok(None) => {},
                    Err(e) => {
                        tracing::warn!(service = file.service, config = file.config_type, error = %&*e, "Config unreadable");
                        items.push(Extracted::Incomplete {
                            source: format!("{}/{}", file.service, file.config_type),
                            reason: (*e).to_string(),
                        });
                        first_error.get_or_insert(e);
                    },
                }
            }

            if read == 0 {
                let reason = "no service configuration could be read".to_string();
                yield Err(match first_error {
                    Some(e) => e.raise(ErrorKind::Unavailable(reason)),
                    None => Error::from(ErrorKind::Unavailable(reason)),
                });
                return;
            }
            for item in items {
                yield Ok(item);
            }
        }))
    }
}

async fn read_config(file: &ConfigFile, path: &Path) -> Result<ServiceConfigBlob> {
    let text = tokio::fs::read_to_string(path).await.or_raise(|| ErrorKind::Read(file.service))?;
    let invalid = |reason: String| ErrorKind::InvalidConfig(file.service, format!("{}: {reason}", path.display()));
    let data = match file.format {
        Format::Xml => Value::Object(flat_xml(&text).map_err(|e| Error::from(invalid(e)))?),
        Format::Json => serde_json::from_str(&text).or_raise(|| invalid("not valid JSON".to_string()))?,
        Format::Decypharr => {
            let mut config: Value = serde_json::from_str(&text).or_raise(|| invalid("not valid JSON".to_string()))?;
            mask_decypharr(&mut config);
            config
        },
    };
    Ok(ServiceConfigBlob::new(file.service, file.config_type, data))
}

/// Element name to text for every direct child of the root element.
///
/// Children with children of their own (or no text) map to `null`.
fn flat_xml(text: &str) -> std::result::Result<Map<String, Value>, String> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut map = Map::new();
    let mut depth = 0usize;
    let mut seen_root = false;
    let mut current: Option<String> = None;
    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(start) => {
                depth += 1;
                seen_root = true;
                match depth {
                    2 => {
                        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                        map.insert(name.clone(), Value::Null);
                        current = Some(name);
                    },
                    3.. => {
                        if let Some(name) = current.take() {
                            map.insert(name, Value::Null);
                        }
                    },
                    _ => {},
                }
            },
            Event::Empty(empty) => {
                seen_root = true;
                if depth == 1 {
                    map.insert(String::from_utf8_lossy(empty.name().as_ref()).into_owned(), Value::Null);
                }
            },
            Event::Text(content) if depth == 2 => {
                if let Some(name) = &current {
                    let value = content.unescape().map_err(|e| e.to_string())?.into_owned();
                    map.insert(name.clone(), Value::String(value));
                }
            },
            Event::CData(content) if depth == 2 => {
                if let Some(name) = &current {
                    map.insert(name.clone(), Value::String(String::from_utf8_lossy(&content).into_owned()));
                }
            },
            Event::End(_) => {
                if depth == 2 {
                    current = None;
                }
                depth = depth.saturating_sub(1);
            },
            Event::Eof => break,
            _ => {},
        }
    }
    if !seen_root {
        return Err("no root element".to_string());
    }
    Ok(map)
}

fn mask_decypharr(config: &mut Value) {
    mask_entries(config, "debrids", |debrid| {
        if let Some(key) = debrid.get_mut("api_key") {
            *key = json!(MASK);
        }
        if let Some(keys) = debrid.get_mut("download_api_keys") {
            *keys = json!([MASK]);
        }
    });
    mask_entries(config, "arrs", |arr| {
        if let Some(token) = arr.get_mut("token") {
            *token = json!(MASK);
        }
    });
}

fn mask_entries(config: &mut Value, list: &str, mask: impl Fn(&mut Map<String, Value>)) {
    if let Some(entries) = config.get_mut(list).and_then(Value::as_array_mut) {
        for entry in entries.iter_mut().filter_map(Value::as_object_mut) {
            mask(entry);
        }
    }
}

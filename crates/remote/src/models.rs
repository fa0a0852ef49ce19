use crate::error::{ErrorKind, Result};
use derive_more::Display;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::str::FromStr;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

/// One row payload, column name to JSON value.
pub type Row = Map<String, Value>;

pub const DEVICE_COLUMN: &str = "device_id";

/// Per-host identifier that partitions every non-audit table.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[display("{}", _0.hyphenated())]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = uuid::Error;

    /// Accepts both the hyphenated and the 32 hex digit form.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// A device-scoped remote table and the columns forming its natural key
/// (`device_id` excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Table {
    pub name: &'static str,
    pub key_columns: &'static [&'static str],
}

impl Table {
    pub const fn new(name: &'static str, key_columns: &'static [&'static str]) -> Self {
        Self { name, key_columns }
    }

    /// Conflict target for upserts: always `device_id` plus the key columns.
    pub fn conflict_target(&self) -> String {
        std::iter::once(DEVICE_COLUMN).chain(self.key_columns.iter().copied()).collect::<Vec<_>>().join(",")
    }
}

/// Source-native key of a row, one string per key column, in column order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeKey(Vec<String>);

impl NativeKey {
    pub fn new(parts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Read the key columns out of a row. Returns `None` when any of them is
    /// missing, null, or not a scalar.
    pub fn from_row(row: &Row, columns: &[&str]) -> Option<Self> {
        columns
            .iter()
            .map(|column| match row.get(*column)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl std::fmt::Display for NativeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[display("success")]
    Success,
    #[display("partial")]
    Partial,
    #[display("failed")]
    Failed,
}

pub const RUN_COLUMN: &str = "run_id";

/// Append-only audit row, one per orchestrator invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupRun {
    /// Generated once per run; a retried insert with the same id is a no-op.
    pub run_id: Uuid,
    pub device_id: DeviceId,
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
    pub status: RunStatus,
    pub duration_seconds: f64,
    /// Column name (`movies_count`, ...) to number of records upserted.
    pub counts: BTreeMap<String, u64>,
    pub error_message: Option<String>,
    pub details: Value,
}

impl BackupRun {
    pub fn to_row(&self) -> Result<Row> {
        let mut row = Row::new();
        row.insert(RUN_COLUMN.to_string(), json!(self.run_id));
        row.insert(DEVICE_COLUMN.to_string(), json!(self.device_id));
        row.insert("started_at".to_string(), json!(timestamp(self.started_at)?));
        row.insert("finished_at".to_string(), json!(timestamp(self.finished_at)?));
        row.insert("status".to_string(), json!(self.status));
        row.insert("duration_seconds".to_string(), json!(self.duration_seconds));
        for (column, count) in &self.counts {
            row.insert(column.clone(), json!(count));
        }
        row.insert("error_message".to_string(), json!(self.error_message));
        row.insert("details".to_string(), self.details.clone());
        Ok(row)
    }
}

/// Registration row for one physical host.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub device_id: DeviceId,
    pub hostname: String,
    pub mac_address: Option<String>,
    pub ip_address: Option<String>,
    pub version: String,
    pub last_backup_at: Option<OffsetDateTime>,
}

impl Device {
    /// `last_backup_at` is only sent when set, so registering a device at the
    /// start of a run never clears the previous value.
    pub fn to_row(&self) -> Result<Row> {
        let mut row = Row::new();
        row.insert(DEVICE_COLUMN.to_string(), json!(self.device_id));
        row.insert("hostname".to_string(), json!(self.hostname));
        row.insert("mac_address".to_string(), json!(self.mac_address));
        row.insert("ip_address".to_string(), json!(self.ip_address));
        row.insert("version".to_string(), json!(self.version));
        if let Some(at) = self.last_backup_at {
            row.insert("last_backup_at".to_string(), json!(timestamp(at)?));
        }
        Ok(row)
    }
}

const SECRET_SUFFIXES: [&str; 4] = ["_api_key", "_token", "_password", "_secret"];

/// The device's row in `setup_credentials`. Read-only for the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetupCredential {
    pub values: Row,
}

impl SetupCredential {
    /// Every non-empty string stored in a secret-looking column.
    pub fn secrets(&self) -> Vec<String> {
        self.values
            .iter()
            .filter(|(column, _)| SECRET_SUFFIXES.iter().any(|suffix| column.ends_with(suffix)))
            .filter_map(|(_, value)| value.as_str())
            .filter(|value| !value.trim().is_empty())
            .map(str::to_string)
            .collect()
    }
}

pub(crate) fn timestamp(at: OffsetDateTime) -> Result<String> {
    at.format(&Rfc3339).or_raise(|| ErrorKind::Config("unformattable timestamp".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("0b6f3c8e-6f5e-4c1a-9d53-1f0b6a2e9c11")]
    #[case("0b6f3c8e6f5e4c1a9d531f0b6a2e9c11")]
    #[case(" 0B6F3C8E-6F5E-4C1A-9D53-1F0B6A2E9C11\n")]
    fn test_device_id_forms(#[case] input: &str) {
        let id: DeviceId = input.parse().unwrap();
        assert_eq!(id.to_string(), "0b6f3c8e-6f5e-4c1a-9d53-1f0b6a2e9c11");
    }

    #[test]
    fn test_conflict_target_leads_with_device() {
        let table = Table::new("quality_profiles", &["service_name", "profile_id"]);
        assert_eq!(table.conflict_target(), "device_id,service_name,profile_id");
    }

    #[test]
    fn test_native_key_normalizes_scalars() {
        let row: Row = serde_json::from_str(r#"{"service_name": "radarr", "profile_id": 4, "name": "HD"}"#).unwrap();
        let key = NativeKey::from_row(&row, &["service_name", "profile_id"]).unwrap();
        assert_eq!(key, NativeKey::new(["radarr", "4"]));
        assert!(NativeKey::from_row(&row, &["missing"]).is_none());
    }

    #[test]
    fn test_device_row_omits_unset_last_backup() {
        let device = Device {
            device_id: DeviceId::random(),
            hostname: "pi".to_string(),
            mac_address: None,
            ip_address: Some("192.168.1.20".to_string()),
            version: "0.1.0".to_string(),
            last_backup_at: None,
        };
        let row = device.to_row().unwrap();
        assert!(!row.contains_key("last_backup_at"));
        assert_eq!(row["ip_address"], "192.168.1.20");
    }

    #[test]
    fn test_setup_credential_secrets() {
        let values: Row = serde_json::from_str(
            r#"{"device_id": "x", "radarr_api_key": "abc", "jellyfin_password": "", "realdebrid_token": "tok", "hostname": "pi"}"#,
        )
        .unwrap();
        let mut secrets = SetupCredential { values }.secrets();
        secrets.sort();
        assert_eq!(secrets, vec!["abc".to_string(), "tok".to_string()]);
    }
}

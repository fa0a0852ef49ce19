//! Remote store trait and implementations.
//!
//! Every data operation takes the [`DeviceId`] it is scoped to. There is no
//! way to read, write or delete device rows without naming the device, and
//! implementations always add the device filter themselves.

#[cfg(feature = "mock")]
mod mock;
mod postgrest;
mod retry;

#[cfg(feature = "mock")]
pub use self::mock::{Call, MockStore};
pub use self::postgrest::PostgrestStore;
pub use self::retry::{RetryPolicy, RetryingStore};
use crate::error::{ErrorKind, Result};
use crate::models::{BackupRun, DEVICE_COLUMN, Device, DeviceId, NativeKey, Row, SetupCredential, Table};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;

/// Unified interface for the device-scoped backup store.
///
/// Implementations must be safe to share between concurrently reconciled
/// kinds.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Name used in log output only.
    fn name(&self) -> &str;

    /// Insert or update `rows` in `table` for `device`.
    ///
    /// The conflict target is `device_id` plus the table's key columns, so
    /// sending the same rows twice leaves the table unchanged. Returns the
    /// number of rows sent.
    async fn upsert(&self, table: &Table, device: DeviceId, rows: &[Row]) -> Result<u64>;

    /// Delete the rows of `device` whose native key is in `keys`.
    ///
    /// Returns the number of rows removed.
    async fn delete(&self, table: &Table, device: DeviceId, keys: &[NativeKey]) -> Result<u64>;

    /// All native keys currently stored for `device` in `table`.
    async fn fetch_keys(&self, table: &Table, device: DeviceId) -> Result<HashSet<NativeKey>>;

    /// Append one run summary to `backup_history`.
    async fn insert_run_record(&self, run: &BackupRun) -> Result<()>;

    /// Register the device or refresh its details.
    async fn upsert_device(&self, device: &Device) -> Result<()>;

    /// The device's setup credential row, if one exists.
    async fn fetch_setup_credential(&self, device: DeviceId) -> Result<Option<SetupCredential>>;
}

/// Copy `rows`, stamping each with `device`.
///
/// A row that already carries a different `device_id` is refused instead of
/// being silently moved to another device.
pub fn scope_rows(device: DeviceId, rows: &[Row]) -> Result<Vec<Row>> {
    let expected = device.to_string();
    rows.iter()
        .map(|row| {
            match row.get(DEVICE_COLUMN) {
                None | Some(Value::Null) => {},
                Some(Value::String(existing)) if existing.eq_ignore_ascii_case(&expected) => {},
                Some(other) => exn::bail!(ErrorKind::ScopeViolation(other.to_string())),
            }
            let mut scoped = row.clone();
            scoped.insert(DEVICE_COLUMN.to_string(), Value::String(expected.clone()));
            Ok(scoped)
        })
        .collect()
}

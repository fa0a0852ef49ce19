//! In-memory remote store for testing.

use super::{RemoteStore, scope_rows};
use crate::error::{ErrorKind, Result};
use crate::models::{BackupRun, Device, DeviceId, NativeKey, Row, SetupCredential, Table};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

type TableKey = (&'static str, DeviceId);

/// One recorded trait call, for asserting on device scoping and retries.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Upsert { table: &'static str, device: DeviceId, rows: usize },
    Delete { table: &'static str, device: DeviceId, keys: Vec<NativeKey> },
    FetchKeys { table: &'static str, device: DeviceId },
    InsertRunRecord { device: DeviceId },
    UpsertDevice { device: DeviceId },
    FetchSetupCredential { device: DeviceId },
}

impl Call {
    pub fn device(&self) -> DeviceId {
        match self {
            Self::Upsert { device, .. }
            | Self::Delete { device, .. }
            | Self::FetchKeys { device, .. }
            | Self::InsertRunRecord { device }
            | Self::UpsertDevice { device }
            | Self::FetchSetupCredential { device } => *device,
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Self::Upsert { .. } => "upsert",
            Self::Delete { .. } => "delete",
            Self::FetchKeys { .. } => "fetch_keys",
            Self::InsertRunRecord { .. } => "insert_run_record",
            Self::UpsertDevice { .. } => "upsert_device",
            Self::FetchSetupCredential { .. } => "fetch_setup_credential",
        }
    }

    fn table(&self) -> Option<&'static str> {
        match self {
            Self::Upsert { table, .. } | Self::Delete { table, .. } | Self::FetchKeys { table, .. } => Some(*table),
            _ => None,
        }
    }
}

struct Fault {
    operation: &'static str,
    table: Option<&'static str>,
    /// `None` fails forever.
    remaining: Option<u32>,
    transient: bool,
}

/// In-memory remote store for testing.
///
/// Rows live in a map behind a [`RwLock`], keyed by table, device and native
/// key, so upserts and deletes behave like the real conflict target. Faults
/// can be injected per operation (and optionally per table).
///
/// # Examples
///
/// ```
/// use supabazarr_remote::models::{DeviceId, Table};
/// use supabazarr_remote::{MockStore, RemoteStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// const MOVIES: Table = Table::new("movies", &["radarr_id"]);
/// let store = MockStore::default().with_transient_failures("upsert", Some("movies"), 2);
/// let device = DeviceId::random();
/// assert!(store.upsert(&MOVIES, device, &[]).await.is_err());
/// # }
/// ```
pub struct MockStore {
    name: String,
    tables: RwLock<HashMap<TableKey, BTreeMap<NativeKey, Row>>>,
    runs: RwLock<Vec<BackupRun>>,
    devices: RwLock<HashMap<DeviceId, Row>>,
    credentials: RwLock<HashMap<DeviceId, SetupCredential>>,
    calls: Mutex<Vec<Call>>,
    faults: Mutex<Vec<Fault>>,
    changes: AtomicU64,
}

impl Default for MockStore {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            tables: RwLock::new(HashMap::new()),
            runs: RwLock::new(Vec::new()),
            devices: RwLock::new(HashMap::new()),
            credentials: RwLock::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            changes: AtomicU64::new(0),
        }
    }
}

impl MockStore {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Fail the next `times` calls of `operation` with a transient error.
    pub fn with_transient_failures(self, operation: &'static str, table: Option<&'static str>, times: u32) -> Self {
        self.push_fault(Fault { operation, table, remaining: Some(times), transient: true });
        self
    }

    /// Reject every call of `operation`.
    pub fn with_rejection(self, operation: &'static str, table: Option<&'static str>) -> Self {
        self.push_fault(Fault { operation, table, remaining: None, transient: false });
        self
    }

    pub fn with_setup_credential(mut self, device: DeviceId, credential: SetupCredential) -> Self {
        self.credentials.get_mut().insert(device, credential);
        self
    }

    fn push_fault(&self, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push(fault);
        }
    }

    /// Pre-populate rows without recording a call.
    pub async fn seed(&self, table: &Table, device: DeviceId, rows: impl IntoIterator<Item = Row>) {
        let rows: Vec<Row> = rows.into_iter().collect();
        let Ok(scoped) = scope_rows(device, &rows) else {
            panic!("MockStore::seed: rows scoped to another device");
        };
        let mut tables = self.tables.write().await;
        let entry = tables.entry((table.name, device)).or_default();
        for row in scoped {
            let Some(key) = NativeKey::from_row(&row, table.key_columns) else {
                panic!("MockStore::seed: row without native key in {}", table.name);
            };
            entry.insert(key, row);
        }
    }

    pub async fn rows(&self, table: &Table, device: DeviceId) -> Vec<Row> {
        self.tables.read().await.get(&(table.name, device)).map(|rows| rows.values().cloned().collect()).unwrap_or_default()
    }

    pub async fn keys(&self, table: &Table, device: DeviceId) -> BTreeSet<NativeKey> {
        self.tables.read().await.get(&(table.name, device)).map(|rows| rows.keys().cloned().collect()).unwrap_or_default()
    }

    pub async fn runs(&self) -> Vec<BackupRun> {
        self.runs.read().await.clone()
    }

    pub async fn device(&self, device: DeviceId) -> Option<Row> {
        self.devices.read().await.get(&device).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Rows inserted, modified or deleted since creation. Rewriting a row with
    /// identical content does not count.
    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) -> Result<()> {
        let fault = {
            let Ok(mut faults) = self.faults.lock() else {
                return Ok(());
            };
            faults
                .iter_mut()
                .find(|f| {
                    f.operation == call.operation()
                        && f.table.is_none_or(|t| Some(t) == call.table())
                        && f.remaining.is_none_or(|n| n > 0)
                })
                .map(|f| {
                    if let Some(n) = f.remaining.as_mut() {
                        *n -= 1;
                    }
                    f.transient
                })
        };
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        match fault {
            Some(true) => exn::bail!(ErrorKind::Transient("injected transient failure".to_string())),
            Some(false) => exn::bail!(ErrorKind::Rejected { status: 400, message: "injected rejection".to_string() }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MockStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, table: &Table, device: DeviceId, rows: &[Row]) -> Result<u64> {
        self.record(Call::Upsert { table: table.name, device, rows: rows.len() })?;
        let scoped = scope_rows(device, rows)?;
        let mut keyed = BTreeMap::new();
        for row in scoped {
            let Some(key) = NativeKey::from_row(&row, table.key_columns) else {
                exn::bail!(ErrorKind::Rejected { status: 400, message: "null value in key column".to_string() });
            };
            if keyed.insert(key, row).is_some() {
                exn::bail!(ErrorKind::Rejected {
                    status: 400,
                    message: "command cannot affect row a second time".to_string()
                });
            }
        }
        let mut tables = self.tables.write().await;
        let stored = tables.entry((table.name, device)).or_default();
        for (key, row) in keyed {
            if stored.get(&key) != Some(&row) {
                self.changes.fetch_add(1, Ordering::SeqCst);
                stored.insert(key, row);
            }
        }
        Ok(rows.len() as u64)
    }

    async fn delete(&self, table: &Table, device: DeviceId, keys: &[NativeKey]) -> Result<u64> {
        self.record(Call::Delete { table: table.name, device, keys: keys.to_vec() })?;
        let mut tables = self.tables.write().await;
        let Some(stored) = tables.get_mut(&(table.name, device)) else {
            return Ok(0);
        };
        let deleted = keys.iter().filter(|key| stored.remove(*key).is_some()).count() as u64;
        self.changes.fetch_add(deleted, Ordering::SeqCst);
        Ok(deleted)
    }

    async fn fetch_keys(&self, table: &Table, device: DeviceId) -> Result<HashSet<NativeKey>> {
        self.record(Call::FetchKeys { table: table.name, device })?;
        Ok(self.keys(table, device).await.into_iter().collect())
    }

    async fn insert_run_record(&self, run: &BackupRun) -> Result<()> {
        self.record(Call::InsertRunRecord { device: run.device_id })?;
        let mut runs = self.runs.write().await;
        if !runs.iter().any(|stored| stored.run_id == run.run_id) {
            runs.push(run.clone());
        }
        Ok(())
    }

    async fn upsert_device(&self, device: &Device) -> Result<()> {
        self.record(Call::UpsertDevice { device: device.device_id })?;
        let row = device.to_row()?;
        let mut devices = self.devices.write().await;
        let stored = devices.entry(device.device_id).or_default();
        stored.extend(row);
        Ok(())
    }

    async fn fetch_setup_credential(&self, device: DeviceId) -> Result<Option<SetupCredential>> {
        self.record(Call::FetchSetupCredential { device })?;
        Ok(self.credentials.read().await.get(&device).cloned())
    }
}

//! Reconciliation of one kind: make the device's remote rows equal the
//! latest local extraction.
//!
//! 1. fetch the native keys the remote currently holds for the device,
//! 2. upsert every extracted record in batches,
//! 3. delete the remote rows whose key was not extracted (orphans).
//!
//! Orphans are only deleted when the extraction is known to be complete and
//! the remote key set could be read. Upserts are idempotent, so running the
//! same extraction twice changes nothing the second time.

use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use std::collections::HashSet;
use supabazarr_remote::StoreHandle;
use supabazarr_remote::models::{DeviceId, NativeKey, Row, Table};
use supabazarr_source::error::Result as SourceResult;
use supabazarr_source::{Extracted, Kind};
use tracing::instrument;

/// Outcome of reconciling one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileResult {
    pub kind: Kind,
    /// Records accepted by the remote store.
    pub upserted: u64,
    /// Records in batches the remote store refused (or kept failing).
    pub failed: u64,
    /// Rows that failed validation, lacked a key, or repeated a key.
    pub skipped: u64,
    pub orphaned_deleted: u64,
    pub orphan_delete_failed: u64,
    /// Orphans were left alone because the extraction was empty.
    pub orphans_suppressed: bool,
    /// Part of the source could not be read; orphans were not computed.
    pub incomplete: bool,
    /// First unrecoverable error (upsert or extraction), if any.
    pub error: Option<String>,
}

impl ReconcileResult {
    fn new(kind: Kind) -> Self {
        Self {
            kind,
            upserted: 0,
            failed: 0,
            skipped: 0,
            orphaned_deleted: 0,
            orphan_delete_failed: 0,
            orphans_suppressed: false,
            incomplete: false,
            error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn details(&self) -> Value {
        json!({
            "upserted": self.upserted,
            "failed": self.failed,
            "skipped": self.skipped,
            "orphaned_deleted": self.orphaned_deleted,
            "orphan_delete_failed": self.orphan_delete_failed,
            "orphans_suppressed": self.orphans_suppressed,
            "incomplete": self.incomplete,
        })
    }

    fn fail(&mut self, error: String) {
        self.error.get_or_insert(error);
    }
}

/// The remote table records of `kind` are stored in.
pub fn table(kind: Kind) -> Table {
    Table::new(kind.table_name(), kind.key_columns())
}

#[derive(Clone)]
pub struct Reconciler {
    store: StoreHandle,
    batch_size: usize,
    allow_empty_wipe: bool,
}

impl Reconciler {
    pub fn new(store: StoreHandle, batch_size: usize) -> Self {
        Self { store, batch_size: batch_size.max(1), allow_empty_wipe: false }
    }

    /// Let an empty extraction delete every remote row of the kind.
    pub fn with_empty_wipe(mut self, allow: bool) -> Self {
        self.allow_empty_wipe = allow;
        self
    }

    #[instrument(skip_all, fields(kind = %kind, device = %device))]
    pub async fn reconcile<S>(&self, kind: Kind, device: DeviceId, records: S) -> ReconcileResult
    where
        S: Stream<Item = SourceResult<Extracted>>,
    {
        let table = table(kind);
        let mut result = ReconcileResult::new(kind);

        let remote_keys = match self.store.fetch_keys(&table, device).await {
            Ok(keys) => Some(keys),
            Err(e) => {
                tracing::warn!(error = %&*e, "Cannot list remote keys, orphans will not be deleted");
                None
            },
        };

        let mut records = std::pin::pin!(records);
        let mut seen: HashSet<NativeKey> = HashSet::new();
        let mut batch: Vec<Row> = Vec::with_capacity(self.batch_size);
        while let Some(item) = records.next().await {
            match item {
                Ok(Extracted::Record(record)) => {
                    if record.kind() != kind {
                        tracing::warn!(record = %record.kind(), "Record of the wrong kind, skipping");
                        result.skipped += 1;
                        continue;
                    }
                    let row = record.to_row();
                    let Some(key) = NativeKey::from_row(&row, table.key_columns) else {
                        result.skipped += 1;
                        continue;
                    };
                    if !seen.insert(key.clone()) {
                        tracing::debug!(key = %key, "Duplicate key in extraction, skipping");
                        result.skipped += 1;
                        continue;
                    }
                    batch.push(row);
                    if batch.len() >= self.batch_size {
                        self.upsert(&table, device, &mut batch, &mut result).await;
                    }
                },
                Ok(Extracted::Skipped { .. }) => result.skipped += 1,
                Ok(Extracted::Incomplete { source, reason }) => {
                    tracing::warn!(source = %source, reason = %reason, "Extraction incomplete");
                    result.incomplete = true;
                },
                Err(e) => {
                    tracing::warn!(error = %&*e, "Extraction ended early");
                    result.incomplete = true;
                    result.fail((*e).to_string());
                    break;
                },
            }
        }
        if !batch.is_empty() {
            self.upsert(&table, device, &mut batch, &mut result).await;
        }

        match remote_keys {
            Some(_) if result.incomplete => {
                tracing::info!("Extraction incomplete, keeping remote rows that were not seen");
            },
            Some(remote) => self.delete_orphans(&table, device, remote, &seen, &mut result).await,
            None => {},
        }

        tracing::info!(
            upserted = result.upserted,
            failed = result.failed,
            skipped = result.skipped,
            orphaned_deleted = result.orphaned_deleted,
            "Reconciled"
        );
        result
    }

    async fn upsert(&self, table: &Table, device: DeviceId, batch: &mut Vec<Row>, result: &mut ReconcileResult) {
        let rows = std::mem::take(batch);
        let count = rows.len() as u64;
        match self.store.upsert(table, device, &rows).await {
            Ok(_) => result.upserted += count,
            Err(e) => {
                tracing::warn!(rows = count, error = %&*e, "Upsert batch failed");
                result.failed += count;
                result.fail((*e).to_string());
            },
        }
    }

    async fn delete_orphans(
        &self,
        table: &Table,
        device: DeviceId,
        remote: HashSet<NativeKey>,
        seen: &HashSet<NativeKey>,
        result: &mut ReconcileResult,
    ) {
        let mut orphans: Vec<NativeKey> = remote.into_iter().filter(|key| !seen.contains(key)).collect();
        if orphans.is_empty() {
            return;
        }
        if seen.is_empty() && !self.allow_empty_wipe {
            tracing::warn!(orphans = orphans.len(), "Extraction is empty, refusing to delete every remote row");
            result.orphans_suppressed = true;
            return;
        }
        orphans.sort();
        for chunk in orphans.chunks(self.batch_size) {
            match self.store.delete(table, device, chunk).await {
                Ok(deleted) => result.orphaned_deleted += deleted,
                Err(e) => {
                    tracing::warn!(keys = chunk.len(), error = %&*e, "Orphan deletion failed");
                    result.orphan_delete_failed += chunk.len() as u64;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::Arc;
    use supabazarr_remote::MockStore;
    use supabazarr_remote::store::Call;
    use supabazarr_source::Record;
    use supabazarr_source::error::ErrorKind as SourceErrorKind;
    use supabazarr_source::models::{IndexerConfig, QualityProfile};

    fn indexer(id: i64) -> SourceResult<Extracted> {
        Ok(Extracted::Record(Record::Indexer(IndexerConfig {
            native_id: id,
            name: format!("indexer {id}"),
            ..IndexerConfig::default()
        })))
    }

    fn remote_indexer(id: i64) -> Row {
        match json!({"prowlarr_id": id, "name": format!("indexer {id}")}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn keys(ids: &[i64]) -> Vec<NativeKey> {
        ids.iter().map(|id| NativeKey::new([id.to_string()])).collect()
    }

    fn setup(store: &Arc<MockStore>, batch_size: usize) -> Reconciler {
        Reconciler::new(store.clone(), batch_size)
    }

    #[tokio::test]
    async fn test_orphans_are_deleted() {
        let store = Arc::new(MockStore::default());
        let device = DeviceId::random();
        let table = table(Kind::Indexers);
        store.seed(&table, device, [1, 2, 3].map(remote_indexer)).await;

        let records = stream::iter([indexer(2), indexer(3), indexer(4)]);
        let result = setup(&store, 500).reconcile(Kind::Indexers, device, records).await;

        assert_eq!(result.upserted, 3);
        assert_eq!(result.orphaned_deleted, 1);
        assert_eq!(store.keys(&table, device).await.into_iter().collect::<Vec<_>>(), keys(&[2, 3, 4]));
        assert!(store.calls().contains(&Call::Delete { table: "indexers", device, keys: keys(&[1]) }));
    }

    #[tokio::test]
    async fn test_batches_and_duplicates() {
        let store = Arc::new(MockStore::default());
        let device = DeviceId::random();
        let records = stream::iter([indexer(1), indexer(2), indexer(2), indexer(3), indexer(4), indexer(5)]);
        let result = setup(&store, 2).reconcile(Kind::Indexers, device, records).await;

        assert_eq!(result.upserted, 5);
        assert_eq!(result.skipped, 1);
        let upserts: Vec<usize> = store
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Upsert { rows, .. } => Some(rows),
                _ => None,
            })
            .collect();
        assert_eq!(upserts, [2, 2, 1]);
    }

    #[tokio::test]
    async fn test_rejected_batch_does_not_stop_the_kind() {
        let store = Arc::new(MockStore::default().with_rejection("upsert", Some("indexers")));
        let device = DeviceId::random();
        let table = table(Kind::Indexers);
        store.seed(&table, device, [remote_indexer(9)]).await;

        let records = stream::iter([indexer(1), indexer(2), indexer(3)]);
        let result = setup(&store, 2).reconcile(Kind::Indexers, device, records).await;

        assert_eq!(result.failed, 3);
        assert!(result.is_failed());
        // Every batch was attempted.
        assert_eq!(store.calls().iter().filter(|c| matches!(c, Call::Upsert { .. })).count(), 2);
        // Failed upserts still count as extracted, the orphan goes.
        assert_eq!(result.orphaned_deleted, 1);
    }

    #[tokio::test]
    async fn test_incomplete_extraction_keeps_orphans() {
        let store = Arc::new(MockStore::default());
        let device = DeviceId::random();
        let table = table(Kind::QualityProfiles);
        let profile = |service: &str, id: i64| QualityProfile {
            service_name: service.to_string(),
            profile_id: id,
            name: "Any".to_string(),
            cutoff: None,
            upgrade_allowed: false,
            items: Value::Null,
        };
        store.seed(&table, device, [Record::QualityProfile(profile("radarr", 1)).to_row()]).await;

        let records = stream::iter([
            Ok(Extracted::Incomplete { source: "radarr".into(), reason: "locked".into() }),
            Ok(Extracted::Record(Record::QualityProfile(profile("sonarr", 1)))),
        ]);
        let result = setup(&store, 500).reconcile(Kind::QualityProfiles, device, records).await;

        assert!(result.incomplete);
        assert!(!result.is_failed());
        assert_eq!(result.upserted, 1);
        assert_eq!(result.orphaned_deleted, 0);
        assert_eq!(store.keys(&table, device).await.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_error_fails_the_kind_and_keeps_orphans() {
        let store = Arc::new(MockStore::default());
        let device = DeviceId::random();
        let table = table(Kind::Indexers);
        store.seed(&table, device, [remote_indexer(7)]).await;

        let records = stream::iter([indexer(1), Err(exn::Exn::from(SourceErrorKind::Read("prowlarr")))]);
        let result = setup(&store, 500).reconcile(Kind::Indexers, device, records).await;

        assert!(result.is_failed());
        assert_eq!(result.upserted, 1);
        assert_eq!(store.keys(&table, device).await.len(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_remote_keys_disable_orphans() {
        let store = Arc::new(MockStore::default().with_rejection("fetch_keys", None));
        let device = DeviceId::random();
        let table = table(Kind::Indexers);
        store.seed(&table, device, [remote_indexer(7)]).await;

        let result = setup(&store, 500).reconcile(Kind::Indexers, device, stream::iter([indexer(1)])).await;
        assert!(!result.is_failed());
        assert!(!store.calls().iter().any(|c| matches!(c, Call::Delete { .. })));
    }

    #[tokio::test]
    async fn test_empty_extraction_guard() {
        let store = Arc::new(MockStore::default());
        let device = DeviceId::random();
        let table = table(Kind::Indexers);
        store.seed(&table, device, [1, 2].map(remote_indexer)).await;

        let result = setup(&store, 500).reconcile(Kind::Indexers, device, stream::empty()).await;
        assert!(result.orphans_suppressed);
        assert_eq!(store.keys(&table, device).await.len(), 2);

        let wipe = setup(&store, 500).with_empty_wipe(true);
        let result = wipe.reconcile(Kind::Indexers, device, stream::empty()).await;
        assert!(!result.orphans_suppressed);
        assert_eq!(result.orphaned_deleted, 2);
        assert!(store.keys(&table, device).await.is_empty());
    }

    #[tokio::test]
    async fn test_orphan_delete_failure_is_counted_not_fatal() {
        let store = Arc::new(MockStore::default().with_rejection("delete", None));
        let device = DeviceId::random();
        let table = table(Kind::Indexers);
        store.seed(&table, device, [1, 2].map(remote_indexer)).await;

        let result = setup(&store, 500).reconcile(Kind::Indexers, device, stream::iter([indexer(2)])).await;
        assert!(!result.is_failed());
        assert_eq!(result.orphan_delete_failed, 1);
    }
}

//! Backup run orchestration.
//!
//! A run resolves the device identity, registers the device, then extracts
//! and reconciles every kind in [`Kind::ALL`] order. Failures of one kind
//! never stop the others; they only shape the run status. Exactly one
//! [`BackupRun`] summary is written per run that got past identity
//! resolution.

use crate::error::{ErrorKind, Result};
use crate::identity::{DeviceIdentity, IdentityResolver};
use crate::reconcile::{ReconcileResult, Reconciler};
use crate::redact::Redactor;
use crate::status::{RunState, StatusReader, StatusWriter};
use exn::ResultExt;
use futures::StreamExt;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use supabazarr_config::Config;
use supabazarr_remote::models::{BackupRun, DeviceId, RunStatus};
use supabazarr_remote::{PostgrestStore, RetryPolicy, RetryingStore, StoreHandle};
use supabazarr_source::error::ErrorKind as SourceErrorKind;
use supabazarr_source::{AdapterHandle, Kind, Layout, SourceOptions};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub batch_size: usize,
    /// Kinds processed at the same time; results stay in kind order.
    pub concurrency: usize,
    /// Leave out the high-volume episodes kind.
    pub light_mode: bool,
    pub allow_empty_wipe: bool,
    /// Reported in the device registration row.
    pub version: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            concurrency: 1,
            light_mode: false,
            allow_empty_wipe: false,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// What happened to one kind during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum KindOutcome {
    /// No adapter configured, or left out by light mode. Does not count
    /// towards the run status.
    Disabled,
    /// The source could not be opened; nothing was sent.
    Unavailable(String),
    /// The run was cancelled before this kind started.
    Cancelled,
    Reconciled(ReconcileResult),
}

impl KindOutcome {
    fn is_considered(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub fn is_failure(&self) -> bool {
        match self {
            Self::Disabled => false,
            Self::Unavailable(_) | Self::Cancelled => true,
            Self::Reconciled(result) => result.is_failed(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Unavailable(_) => "unavailable",
            Self::Cancelled => "cancelled",
            Self::Reconciled(result) if result.is_failed() => "failed",
            Self::Reconciled(_) => "ok",
        }
    }

    fn error(&self) -> Option<&str> {
        match self {
            Self::Unavailable(reason) => Some(reason),
            Self::Cancelled => Some("run cancelled"),
            Self::Reconciled(result) => result.error.as_deref(),
            Self::Disabled => None,
        }
    }

    pub fn upserted(&self) -> u64 {
        match self {
            Self::Reconciled(result) => result.upserted,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KindReport {
    pub kind: Kind,
    pub outcome: KindOutcome,
}

/// Everything the caller needs to know about a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: Uuid,
    pub device_id: DeviceId,
    /// Final status; `Failed` when the summary could not be written.
    pub status: RunStatus,
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
    pub kinds: Vec<KindReport>,
    /// The summary row reached `backup_history`.
    pub record_written: bool,
    pub error_message: Option<String>,
}

impl RunReport {
    pub fn kind(&self, kind: Kind) -> Option<&KindOutcome> {
        self.kinds.iter().find(|k| k.kind == kind).map(|k| &k.outcome)
    }
}

/// `success` when no considered kind failed, `failed` when all of them did,
/// `partial` otherwise. A run with nothing to consider succeeds.
pub fn derive_status(kinds: &[KindReport]) -> RunStatus {
    let considered = kinds.iter().filter(|k| k.outcome.is_considered()).count();
    let failed = kinds.iter().filter(|k| k.outcome.is_failure()).count();
    match failed {
        0 => RunStatus::Success,
        n if n == considered => RunStatus::Failed,
        _ => RunStatus::Partial,
    }
}

pub struct Engine {
    store: StoreHandle,
    adapters: Vec<AdapterHandle>,
    identity: IdentityResolver,
    reconciler: Reconciler,
    options: EngineOptions,
    secrets: Vec<String>,
    status: StatusWriter,
}

impl Engine {
    pub fn new(
        store: StoreHandle,
        adapters: Vec<AdapterHandle>,
        identity: IdentityResolver,
        options: EngineOptions,
    ) -> Self {
        let reconciler =
            Reconciler::new(store.clone(), options.batch_size).with_empty_wipe(options.allow_empty_wipe);
        Self { store, adapters, identity, reconciler, options, secrets: Vec::new(), status: StatusWriter::new() }
    }

    /// Wire up the PostgREST store (behind the retry policy), the default
    /// adapters and the identity resolver from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let remote = &config.remote;
        let client = PostgrestStore::new(&remote.url, remote.service_key.expose(), remote.schema.clone(), remote.timeout())
            .or_raise(|| ErrorKind::Config("remote"))?;
        let policy = RetryPolicy {
            max_attempts: remote.retry.max_attempts,
            base_delay: Duration::from_millis(remote.retry.base_delay_ms),
            max_delay: Duration::from_millis(remote.retry.max_delay_ms),
            jitter: remote.retry.jitter,
        };
        let store: StoreHandle = Arc::new(RetryingStore::new(Arc::new(client), policy));

        let sources = &config.sources;
        let layout = Layout {
            radarr: sources.radarr_dir(),
            sonarr: sources.sonarr_dir(),
            prowlarr: sources.prowlarr_dir(),
            jellyfin: sources.jellyfin_dir(),
            decypharr: sources.decypharr_dir(),
            jellyseerr: sources.jellyseerr_dir(),
        };
        let source_options = SourceOptions { open_timeout: sources.open_timeout(), busy_timeout: sources.busy_timeout() };
        let adapters = supabazarr_source::default_adapters(&layout, source_options);

        let options = EngineOptions {
            batch_size: remote.batch_size,
            concurrency: config.run.concurrency,
            light_mode: config.run.light_mode,
            allow_empty_wipe: config.run.allow_empty_wipe,
            ..EngineOptions::default()
        };
        let identity = IdentityResolver::from_config(&config.device)?;
        Ok(Self::new(store, adapters, identity, options).with_secret(remote.service_key.expose()))
    }

    /// Never let `secret` reach the run summary.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secrets.push(secret.into());
        self
    }

    pub fn status(&self) -> StatusReader {
        self.status.reader()
    }

    /// Run one full backup pass.
    ///
    /// # Errors
    /// Only [`ErrorKind::IdentityUnavailable`]: without a device id nothing
    /// can be written, not even the run summary. Every other failure is part
    /// of the returned [`RunReport`].
    #[instrument(skip_all)]
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = OffsetDateTime::now_utc();
        let clock = Instant::now();
        self.status.set(RunState::Started);

        let identity = match self.identity.resolve().await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::error!(error = %&*e, "Cannot resolve device identity, aborting run");
                self.status.finish(RunStatus::Failed, OffsetDateTime::now_utc());
                return Err(e);
            },
        };
        let device = identity.device_id;
        tracing::info!(device = %device, hostname = %identity.hostname, "Starting backup run");

        if let Err(e) = self.store.upsert_device(&identity.device(&self.options.version, None)).await {
            tracing::warn!(error = %&*e, "Device registration failed");
        }
        let redactor = self.redactor(device).await;

        let kinds: Vec<KindReport> = futures::stream::iter(Kind::ALL)
            .map(|kind| self.run_kind(kind, device, cancel))
            .buffered(self.options.concurrency.max(1))
            .collect()
            .await;

        self.status.set(RunState::Finalizing);
        let finished_at = OffsetDateTime::now_utc();
        let mut status = derive_status(&kinds);
        let error_message = kinds
            .iter()
            .find_map(|k| k.outcome.error().filter(|_| k.outcome.is_failure()).map(|e| format!("{}: {e}", k.kind)))
            .map(|message| redactor.redact(&message));
        let run = BackupRun {
            run_id,
            device_id: device,
            started_at,
            finished_at,
            status,
            duration_seconds: clock.elapsed().as_secs_f64(),
            counts: Kind::ALL.iter().map(|kind| (kind.count_column().to_string(), upserted(&kinds, *kind))).collect(),
            error_message: error_message.clone(),
            details: details(&identity, &self.options, &kinds, &redactor),
        };

        let record_written = match self.store.insert_run_record(&run).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %&*e, "Cannot write run summary");
                status = RunStatus::Failed;
                false
            },
        };
        if status != RunStatus::Failed {
            let device_row = identity.device(&self.options.version, Some(finished_at));
            if let Err(e) = self.store.upsert_device(&device_row).await {
                tracing::warn!(error = %&*e, "Cannot update last backup time");
            }
        }

        self.status.finish(status, finished_at);
        tracing::info!(
            status = %status,
            duration_seconds = run.duration_seconds,
            record_written,
            "Backup run finished"
        );
        Ok(RunReport { run_id, device_id: device, status, started_at, finished_at, kinds, record_written, error_message })
    }

    #[instrument(skip(self, device, cancel))]
    async fn run_kind(&self, kind: Kind, device: DeviceId, cancel: &CancellationToken) -> KindReport {
        let report = |outcome| KindReport { kind, outcome };
        let Some(adapter) = self.adapters.iter().find(|a| a.kind() == kind) else {
            return report(KindOutcome::Disabled);
        };
        if self.options.light_mode && kind == Kind::Episodes {
            tracing::debug!("Light mode, skipping");
            return report(KindOutcome::Disabled);
        }
        if cancel.is_cancelled() {
            return report(KindOutcome::Cancelled);
        }

        self.status.set(RunState::Extracting(kind));
        let mut records = adapter.extract();
        let first = records.next().await;
        if let Some(Err(e)) = &first
            && matches!(&**e, SourceErrorKind::Unavailable(_))
        {
            tracing::warn!(error = %&**e, "Source unavailable");
            return report(KindOutcome::Unavailable((*e).to_string()));
        }

        self.status.set(RunState::Reconciling(kind));
        let records = futures::stream::iter(first).chain(records);
        report(KindOutcome::Reconciled(self.reconciler.reconcile(kind, device, records).await))
    }

    /// Secrets from the engine itself plus the device's setup credentials.
    async fn redactor(&self, device: DeviceId) -> Redactor {
        let mut secrets = self.secrets.clone();
        match self.store.fetch_setup_credential(device).await {
            Ok(Some(credential)) => secrets.extend(credential.secrets()),
            Ok(None) => {},
            Err(e) => tracing::warn!(error = %&*e, "Cannot read setup credentials"),
        }
        Redactor::new(secrets)
    }
}

fn upserted(kinds: &[KindReport], kind: Kind) -> u64 {
    kinds.iter().find(|k| k.kind == kind).map_or(0, |k| k.outcome.upserted())
}

fn details(identity: &DeviceIdentity, options: &EngineOptions, kinds: &[KindReport], redactor: &Redactor) -> Value {
    let mut per_kind = Map::new();
    for report in kinds {
        let mut entry = match &report.outcome {
            KindOutcome::Reconciled(result) => result.details(),
            _ => json!({}),
        };
        if let Value::Object(map) = &mut entry {
            map.insert("status".to_string(), json!(report.outcome.label()));
            if let Some(error) = report.outcome.error() {
                map.insert("error".to_string(), json!(error));
            }
        }
        per_kind.insert(report.kind.to_string(), entry);
    }
    let mut details = json!({
        "hostname": identity.hostname,
        "version": options.version,
        "light_mode": options.light_mode,
        "kinds": per_kind,
    });
    redactor.redact_value(&mut details);
    details
}

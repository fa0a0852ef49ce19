//! Retrying remote store wrapper.
//!
//! Wraps another store and repeats operations that failed with a transient
//! error, waiting an exponentially growing (and optionally jittered) delay
//! between attempts.

use crate::error::{ErrorKind, Result};
use crate::models::{BackupRun, Device, DeviceId, NativeKey, Row, SetupCredential, Table};
use crate::{RemoteStore, StoreHandle};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    ///
    /// `base * 2^(attempt - 1)`, capped at `max_delay`. With jitter the
    /// result is drawn uniformly from the upper half of that range.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let capped = self.base_delay.saturating_mul(1u32 << exponent).min(self.max_delay);
        if !self.jitter {
            return capped;
        }
        let millis = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);
        let half = millis / 2;
        Duration::from_millis(half + rand::thread_rng().gen_range(0..=millis - half))
    }
}

/// Store wrapper applying a [`RetryPolicy`] to every operation.
#[derive(Clone)]
pub struct RetryingStore {
    inner: StoreHandle,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: StoreHandle, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.policy.max_attempts {
                let last = (*err).to_string();
                tracing::error!(store = self.inner.name(), operation, attempts = attempt, "Giving up on remote operation");
                return Err(err.raise(ErrorKind::RetriesExhausted { attempts: attempt, last }));
            }
            let delay = self.policy.delay(attempt);
            tracing::warn!(
                store = self.inner.name(),
                operation,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %&*err,
                "Transient remote failure, retrying",
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl RemoteStore for RetryingStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn upsert(&self, table: &Table, device: DeviceId, rows: &[Row]) -> Result<u64> {
        self.retry("upsert", || self.inner.upsert(table, device, rows)).await
    }

    async fn delete(&self, table: &Table, device: DeviceId, keys: &[NativeKey]) -> Result<u64> {
        self.retry("delete", || self.inner.delete(table, device, keys)).await
    }

    async fn fetch_keys(&self, table: &Table, device: DeviceId) -> Result<HashSet<NativeKey>> {
        self.retry("fetch_keys", || self.inner.fetch_keys(table, device)).await
    }

    async fn insert_run_record(&self, run: &BackupRun) -> Result<()> {
        self.retry("insert_run_record", || self.inner.insert_run_record(run)).await
    }

    async fn upsert_device(&self, device: &Device) -> Result<()> {
        self.retry("upsert_device", || self.inner.upsert_device(device)).await
    }

    async fn fetch_setup_credential(&self, device: DeviceId) -> Result<Option<SetupCredential>> {
        self.retry("fetch_setup_credential", || self.inner.fetch_setup_credential(device)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::ops::Deref;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `fetch_keys` with the given error a fixed number of times.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        rejected: bool,
    }

    #[async_trait]
    impl RemoteStore for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn upsert(&self, _: &Table, _: DeviceId, rows: &[Row]) -> Result<u64> {
            Ok(rows.len() as u64)
        }

        async fn delete(&self, _: &Table, _: DeviceId, _: &[NativeKey]) -> Result<u64> {
            Ok(0)
        }

        async fn fetch_keys(&self, _: &Table, _: DeviceId) -> Result<HashSet<NativeKey>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                if self.rejected {
                    exn::bail!(ErrorKind::Rejected { status: 400, message: "bad".to_string() });
                }
                exn::bail!(ErrorKind::Transient("HTTP 503".to_string()));
            }
            Ok(HashSet::from([NativeKey::new(["1"])]))
        }

        async fn insert_run_record(&self, _: &BackupRun) -> Result<()> {
            Ok(())
        }

        async fn upsert_device(&self, _: &Device) -> Result<()> {
            Ok(())
        }

        async fn fetch_setup_credential(&self, _: DeviceId) -> Result<Option<SetupCredential>> {
            Ok(None)
        }
    }

    const TABLE: Table = Table::new("movies", &["radarr_id"]);

    fn store(failures: u32, rejected: bool) -> (Arc<Flaky>, RetryingStore) {
        let inner = Arc::new(Flaky { failures, calls: AtomicU32::new(0), rejected });
        let policy = RetryPolicy { max_attempts: 3, ..RetryPolicy::default() };
        (inner.clone(), RetryingStore::new(inner, policy))
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_ceiling() {
        let (inner, store) = store(2, false);
        let keys = store.fetch_keys(&TABLE, DeviceId::random()).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_ceiling() {
        let (inner, store) = store(10, false);
        let err = store.fetch_keys(&TABLE, DeviceId::random()).await.unwrap_err();
        assert!(matches!(err.deref(), ErrorKind::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_are_not_retried() {
        let (inner, store) = store(10, true);
        let err = store.fetch_keys(&TABLE, DeviceId::random()).await.unwrap_err();
        assert!(matches!(err.deref(), ErrorKind::Rejected { status: 400, .. }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(6, 1000)]
    #[case(40, 1000)]
    fn test_delay_without_jitter(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        };
        assert_eq!(policy.delay(attempt), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let policy = RetryPolicy { base_delay: Duration::from_millis(400), ..RetryPolicy::default() };
        for _ in 0..100 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(400));
        }
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use rand::Rng;
use tracing::{debug, warn};

use crate::backend::{KeyValueBackend, ScanCursor, WriteCondition};
use crate::clock::Clock;
use crate::config::{RetryConfig, StoreConfig};
use crate::error::{SessionError, StorageError};
use crate::record::{SessionId, SessionRecord, Version};

/// Result of a point lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(SessionRecord),
    /// Physically present but past `expires_at`.
    Expired(SessionRecord),
    NotFound,
}

/// Result of a put that reached the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    VersionConflict,
}

/// Retrying adapter over a [`KeyValueBackend`].
///
/// Transient failures are retried with capped exponential backoff and full
/// jitter; once attempts run out they surface as
/// [`SessionError::BackendUnavailable`]. Nothing is cached.
pub struct StorageClient<B> {
    backend: B,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    consistent_reads: bool,
    page_size: u32,
}

impl<B: KeyValueBackend> StorageClient<B> {
    pub fn new(backend: B, clock: Arc<dyn Clock>, cfg: &StoreConfig) -> Self {
        Self {
            backend,
            clock,
            retry: cfg.retry.clone(),
            consistent_reads: cfg.consistency.is_strong(),
            page_size: cfg.gc.page_size,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Point lookup, classifying expired rows separately from missing ones.
    pub async fn get(&self, id: &SessionId) -> Result<Lookup, SessionError> {
        let backend = &self.backend;
        let consistent = self.consistent_reads;
        let found = self
            .with_retry("get", move || backend.get_item(id, consistent))
            .await?;

        Ok(match found {
            None => Lookup::NotFound,
            Some(record) if record.is_expired(self.now()) => Lookup::Expired(record),
            Some(record) => Lookup::Found(record),
        })
    }

    /// Write `record`. With `expected` set, only if the stored version still
    /// matches; without it, an unconditional overwrite.
    pub async fn put(
        &self,
        record: &SessionRecord,
        expected: Option<&Version>,
    ) -> Result<PutOutcome, SessionError> {
        let condition = match expected {
            Some(v) => WriteCondition::IfVersion(v.clone()),
            None => WriteCondition::Unconditional,
        };
        self.put_with(record, condition).await
    }

    /// Write `record` only if no row exists for its id. The first creator wins.
    pub async fn create(&self, record: &SessionRecord) -> Result<PutOutcome, SessionError> {
        self.put_with(record, WriteCondition::IfAbsent).await
    }

    async fn put_with(
        &self,
        record: &SessionRecord,
        condition: WriteCondition,
    ) -> Result<PutOutcome, SessionError> {
        let backend = &self.backend;
        let condition = &condition;
        self.with_retry("put", move || async move {
            match backend.put_item(record, condition).await {
                Ok(()) => Ok(PutOutcome::Written),
                Err(StorageError::VersionConflict) => Ok(PutOutcome::VersionConflict),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Idempotent delete.
    pub async fn delete(&self, id: &SessionId) -> Result<(), SessionError> {
        let backend = &self.backend;
        self.with_retry("delete", move || backend.delete_item(id)).await
    }

    /// Delete `id` if it is still expired at `cutoff`. Used by sweeps so a
    /// session refreshed after the scan survives.
    pub async fn delete_expired(
        &self,
        id: &SessionId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, SessionError> {
        let backend = &self.backend;
        self.with_retry("delete_expired", move || backend.delete_if_expired(id, cutoff))
            .await
    }

    /// Lazily stream ids that expired before `cutoff`.
    pub fn scan_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Stream<Item = Result<SessionId, SessionError>> + Send + '_ {
        self.scan_expired_from(cutoff, None)
    }

    /// Resume a scan from `cursor` (the last id a previous scan handed out).
    pub fn scan_expired_from(
        &self,
        cutoff: DateTime<Utc>,
        cursor: Option<ScanCursor>,
    ) -> impl Stream<Item = Result<SessionId, SessionError>> + Send + '_ {
        async_stream::try_stream! {
            let mut cursor = cursor;
            loop {
                let backend = &self.backend;
                let limit = self.page_size;
                let from = cursor.take();
                let from_ref = from.as_ref();
                let page = self
                    .with_retry("scan", move || backend.scan_expired_page(cutoff, from_ref, limit))
                    .await?;
                debug!("scan page: {} expired ids, more={}", page.ids.len(), page.next.is_some());
                for id in page.ids {
                    yield id;
                }
                match page.next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, SessionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(StorageError::Transient(msg)) if attempt < self.retry.max_attempts => {
                    let delay = jitter(self.retry.delay_cap(attempt));
                    warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        op, attempt, self.retry.max_attempts, msg, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(StorageError::Transient(msg)) => {
                    return Err(SessionError::BackendUnavailable {
                        attempts: attempt,
                        message: msg,
                    })
                }
                Err(StorageError::VersionConflict) => {
                    return Err(SessionError::Backend(format!("unexpected version conflict on {op}")))
                }
                Err(StorageError::Permanent(msg)) => return Err(SessionError::Backend(msg)),
            }
        }
    }
}

fn jitter(cap: Duration) -> Duration {
    let cap_ms = cap.as_millis() as u64;
    if cap_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
}

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{KeyValueBackend, ScanCursor, ScanPage, WriteCondition};
use crate::error::StorageError;
use crate::record::{SessionId, SessionRecord};

/// In-process backend for tests and single-node development.
///
/// Conditional puts are atomic per id (the dashmap shard lock is held across
/// the version check and the insert), so it behaves like the real table under
/// concurrent writers.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    items: DashMap<SessionId, SessionRecord>,
    failures_left: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Overwrite the stored payload bytes without touching the version.
    pub fn corrupt_payload(&self, id: &SessionId, payload: Vec<u8>) -> bool {
        match self.items.get_mut(id) {
            Some(mut record) => {
                record.payload = payload;
                true
            }
            None => false,
        }
    }

    /// Raw stored record, expired or not.
    pub fn raw(&self, id: &SessionId) -> Option<SessionRecord> {
        self.items.get(id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn injected_failure(&self) -> Result<(), StorageError> {
        let took = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(StorageError::Transient("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get_item(
        &self,
        id: &SessionId,
        _consistent: bool,
    ) -> Result<Option<SessionRecord>, StorageError> {
        self.injected_failure()?;
        Ok(self.raw(id))
    }

    async fn put_item(
        &self,
        record: &SessionRecord,
        condition: &WriteCondition,
    ) -> Result<(), StorageError> {
        self.injected_failure()?;
        match self.items.entry(record.id.clone()) {
            Entry::Occupied(mut existing) => match condition {
                WriteCondition::Unconditional => {
                    existing.insert(record.clone());
                    Ok(())
                }
                WriteCondition::IfVersion(expected) if existing.get().version == *expected => {
                    existing.insert(record.clone());
                    Ok(())
                }
                _ => Err(StorageError::VersionConflict),
            },
            Entry::Vacant(slot) => match condition {
                WriteCondition::IfVersion(_) => Err(StorageError::VersionConflict),
                _ => {
                    slot.insert(record.clone());
                    Ok(())
                }
            },
        }
    }

    async fn delete_item(&self, id: &SessionId) -> Result<(), StorageError> {
        self.injected_failure()?;
        self.items.remove(id);
        Ok(())
    }

    async fn delete_if_expired(
        &self,
        id: &SessionId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        self.injected_failure()?;
        Ok(self
            .items
            .remove_if(id, |_, record| record.expires_at < cutoff)
            .is_some())
    }

    async fn scan_expired_page(
        &self,
        cutoff: DateTime<Utc>,
        cursor: Option<&ScanCursor>,
        limit: u32,
    ) -> Result<ScanPage, StorageError> {
        self.injected_failure()?;
        let mut expired: Vec<SessionId> = self
            .items
            .iter()
            .filter(|r| r.expires_at < cutoff)
            .map(|r| r.key().clone())
            .filter(|id| cursor.map_or(true, |c| *id > c.0))
            .collect();
        expired.sort();

        let limit = limit.max(1) as usize;
        let next = if expired.len() > limit {
            expired.truncate(limit);
            expired.last().cloned().map(ScanCursor)
        } else {
            None
        };
        Ok(ScanPage { ids: expired, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Version;

    fn record(id: &str, expires_at: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            id: SessionId::parse(id).unwrap(),
            payload: b"x".to_vec(),
            expires_at,
            version: Version::generate(),
            last_modified: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let backend = MemoryBackend::new();
        let first = record("s1", Utc::now());
        backend.put_item(&first, &WriteCondition::IfAbsent).await.unwrap();
        assert_eq!(
            backend.put_item(&first, &WriteCondition::IfAbsent).await,
            Err(StorageError::VersionConflict)
        );

        let second = record("s1", Utc::now());
        assert_eq!(
            backend
                .put_item(&second, &WriteCondition::IfVersion(Version::generate()))
                .await,
            Err(StorageError::VersionConflict)
        );
        backend
            .put_item(&second, &WriteCondition::IfVersion(first.version.clone()))
            .await
            .unwrap();
        assert_eq!(backend.raw(&second.id).unwrap().version, second.version);

        let missing = record("s2", Utc::now());
        assert_eq!(
            backend
                .put_item(&missing, &WriteCondition::IfVersion(Version::generate()))
                .await,
            Err(StorageError::VersionConflict)
        );
    }

    #[tokio::test]
    async fn test_scan_pages() {
        let backend = MemoryBackend::new();
        let past = Utc::now() - chrono::Duration::hours(1);
        for i in 0..5 {
            let r = record(&format!("old{i}"), past);
            backend.put_item(&r, &WriteCondition::Unconditional).await.unwrap();
        }
        let live = record("live", Utc::now() + chrono::Duration::hours(1));
        backend.put_item(&live, &WriteCondition::Unconditional).await.unwrap();

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = backend
                .scan_expired_page(Utc::now(), cursor.as_ref(), 2)
                .await
                .unwrap();
            seen.extend(page.ids);
            match page.next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(|id| id.as_str().starts_with("old")));
    }

    #[tokio::test]
    async fn test_delete_if_expired_spares_refreshed_rows() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let stale = record("stale", now - chrono::Duration::minutes(5));
        let fresh = record("fresh", now + chrono::Duration::minutes(5));
        backend.put_item(&stale, &WriteCondition::Unconditional).await.unwrap();
        backend.put_item(&fresh, &WriteCondition::Unconditional).await.unwrap();

        assert!(backend.delete_if_expired(&stale.id, now).await.unwrap());
        assert!(!backend.delete_if_expired(&fresh.id, now).await.unwrap());
        assert!(!backend.delete_if_expired(&stale.id, now).await.unwrap());
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = MemoryBackend::new();
        backend.fail_next(2);
        let id = SessionId::parse("s1").unwrap();
        assert!(backend.get_item(&id, false).await.is_err());
        assert!(backend.get_item(&id, false).await.is_err());
        assert!(backend.get_item(&id, false).await.unwrap().is_none());
    }
}

#[cfg(any(test, feature = "memory-backend"))]
pub mod memory;

#[cfg(feature = "dynamodb-backend")]
pub mod dynamo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::record::{SessionId, SessionRecord, Version};

/// Precondition attached to a put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// Overwrite whatever is stored.
    Unconditional,
    /// Create only; fails if the id exists (expired or not).
    IfAbsent,
    /// Replace only if the stored version matches.
    IfVersion(Version),
}

/// Position to resume an expired-id scan from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor(pub SessionId);

/// One page of an expired-id scan.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub ids: Vec<SessionId>,
    pub next: Option<ScanCursor>,
}

/// Raw key-value operations against the sessions table.
///
/// Implementations perform a single attempt per call and report failures as
/// [`StorageError`]; retrying is the caller's business.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn get_item(
        &self,
        id: &SessionId,
        consistent: bool,
    ) -> Result<Option<SessionRecord>, StorageError>;

    async fn put_item(
        &self,
        record: &SessionRecord,
        condition: &WriteCondition,
    ) -> Result<(), StorageError>;

    /// Deleting an absent id succeeds.
    async fn delete_item(&self, id: &SessionId) -> Result<(), StorageError>;

    /// Delete `id` only if its `expires_at` is still before `cutoff`.
    /// Returns whether a row was removed; a refreshed or absent row is left alone.
    async fn delete_if_expired(
        &self,
        id: &SessionId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Ids whose `expires_at` is strictly before `cutoff`. A page may be empty
    /// while `next` is still set; callers keep going until `next` is `None`.
    async fn scan_expired_page(
        &self,
        cutoff: DateTime<Utc>,
        cursor: Option<&ScanCursor>,
        limit: u32,
    ) -> Result<ScanPage, StorageError>;
}

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::store::SessionHandler;
use super::{merge, Session};
use crate::backend::KeyValueBackend;
use crate::client::{Lookup, PutOutcome, StorageClient};
use crate::clock::Clock;
use crate::codec;
use crate::config::StoreConfig;
use crate::error::SessionError;
use crate::gc::{self, GcReport};
use crate::record::{SessionAttributes, SessionId, SessionRecord, Version};

/// Session store over any key-value backend.
pub struct KvSessionStore<B> {
    client: StorageClient<B>,
    default_ttl_secs: i64,
}

impl<B: KeyValueBackend> KvSessionStore<B> {
    pub fn new(client: StorageClient<B>, default_ttl_secs: i64) -> Self {
        Self {
            client,
            default_ttl_secs,
        }
    }

    pub fn from_config(backend: B, clock: Arc<dyn Clock>, cfg: &StoreConfig) -> Self {
        Self::new(
            StorageClient::new(backend, clock, cfg),
            cfg.default_ttl_seconds,
        )
    }

    pub fn client(&self) -> &StorageClient<B> {
        &self.client
    }

    /// Current attributes and version of the stored row. Unlike `read`,
    /// backend failures propagate.
    async fn load(&self, id: &SessionId) -> Result<(SessionAttributes, Option<Version>), SessionError> {
        Ok(match self.client.get(id).await? {
            Lookup::Found(record) => {
                let attrs = codec::decode(&record.payload).unwrap_or_else(|e| {
                    warn!("Session {} has a corrupt payload, treating as empty: {}", id, e);
                    SessionAttributes::new()
                });
                (attrs, Some(record.version))
            }
            Lookup::Expired(record) => {
                debug!("Session {} expired at {}", id, record.expires_at);
                (SessionAttributes::new(), Some(record.version))
            }
            Lookup::NotFound => (SessionAttributes::new(), None),
        })
    }

    /// One conditional write attempt of `attrs` over `expected`.
    async fn put_attributes(
        &self,
        id: &SessionId,
        attrs: &SessionAttributes,
        expected: Option<&Version>,
        expires_at: DateTime<Utc>,
    ) -> Result<(PutOutcome, Version), SessionError> {
        let record = SessionRecord {
            id: id.clone(),
            payload: codec::encode(attrs),
            expires_at,
            version: Version::generate(),
            last_modified: self.client.now(),
        };
        let outcome = match expected {
            Some(v) => self.client.put(&record, Some(v)).await?,
            None => self.client.create(&record).await?,
        };
        Ok((outcome, record.version))
    }
}

#[async_trait]
impl<B: KeyValueBackend> SessionHandler for KvSessionStore<B> {
    fn open(&self, id: &str) -> Result<SessionId, SessionError> {
        SessionId::parse(id)
    }

    async fn read(&self, id: &SessionId) -> Session {
        match self.load(id).await {
            Ok((attrs, version)) => Session::loaded(id.clone(), attrs, version),
            Err(e) => {
                warn!("Session {} unreadable, starting empty: {}", id, e);
                Session::fresh(id.clone())
            }
        }
    }

    async fn write(&self, session: &mut Session, ttl_secs: i64) -> Result<(), SessionError> {
        let expires_at = chrono::Duration::try_seconds(ttl_secs)
            .filter(|_| ttl_secs > 0)
            .and_then(|ttl| self.client.now().checked_add_signed(ttl))
            .ok_or(SessionError::InvalidTtl(ttl_secs))?;

        let id = session.id().clone();
        let ours = session.attributes().clone();

        let (outcome, version) = self
            .put_attributes(&id, &ours, session.version(), expires_at)
            .await?;
        if outcome == PutOutcome::Written {
            debug!("Session {} written, expires {}", id, expires_at);
            session.committed(ours, version);
            return Ok(());
        }

        // Someone wrote in between. Fold our changes onto theirs once.
        debug!("Session {} version conflict, merging", id);
        let (theirs, fresh_version) = self.load(&id).await?;
        let merged = merge(session.snapshot(), &ours, &theirs)
            .ok_or_else(|| SessionError::ConcurrentModification(id.clone()))?;

        let (outcome, version) = self
            .put_attributes(&id, &merged, fresh_version.as_ref(), expires_at)
            .await?;
        match outcome {
            PutOutcome::Written => {
                debug!("Session {} written after merge", id);
                session.committed(merged, version);
                Ok(())
            }
            PutOutcome::VersionConflict => {
                warn!("Session {} still conflicting after merge", id);
                Err(SessionError::ConcurrentModification(id))
            }
        }
    }

    fn default_ttl_secs(&self) -> i64 {
        self.default_ttl_secs
    }

    async fn destroy(&self, id: &SessionId) -> Result<(), SessionError> {
        self.client.delete(id).await?;
        debug!("Session {} destroyed", id);
        Ok(())
    }

    async fn garbage_collect(&self, cutoff: DateTime<Utc>) -> GcReport {
        gc::sweep(&self.client, cutoff).await
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SessionError;
use crate::gc::GcReport;
use crate::record::SessionId;
use crate::session::Session;

/// The capability set a host's session middleware binds against.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Validate an id. No I/O; the fetch happens in `read`.
    fn open(&self, id: &str) -> Result<SessionId, SessionError>;

    /// Load a session. Never fails: missing, expired, corrupt, or unreachable
    /// sessions come back empty.
    async fn read(&self, id: &SessionId) -> Session;

    /// Persist `session` for `ttl_secs` seconds, guarded by the version it was
    /// read at.
    async fn write(&self, session: &mut Session, ttl_secs: i64) -> Result<(), SessionError>;

    /// TTL applied by `close`.
    fn default_ttl_secs(&self) -> i64;

    /// Persist with the default TTL at the end of a request.
    async fn close(&self, session: &mut Session) -> Result<(), SessionError> {
        let ttl = self.default_ttl_secs();
        self.write(session, ttl).await
    }

    /// Remove a session. Removing an absent session succeeds.
    async fn destroy(&self, id: &SessionId) -> Result<(), SessionError>;

    /// Delete every session that expired before `cutoff`, best-effort.
    async fn garbage_collect(&self, cutoff: DateTime<Utc>) -> GcReport;
}

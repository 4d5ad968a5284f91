use crate::record::SessionId;

/// Core error types for dynasess.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors surfaced to callers of the session store.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Backend unavailable after {attempts} attempts: {message}")]
    BackendUnavailable { attempts: u32, message: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Session {0} was modified concurrently")]
    ConcurrentModification(SessionId),

    #[error("Invalid ttl: {0} seconds")]
    InvalidTtl(i64),

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),
}

/// Errors reported by a raw key-value backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Throttling, timeouts, dropped connections. Safe to retry.
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend error: {0}")]
    Permanent(String),

    /// A conditional write found a different version (or an existing item).
    #[error("version conflict")]
    VersionConflict,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Corrupt session payload: {0}")]
    CorruptPayload(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod error;
pub mod config;
pub mod clock;
pub mod record;
pub mod codec;
pub mod backend;
pub mod client;
pub mod session;
pub mod gc;
pub mod runtime;

pub use client::{Lookup, PutOutcome, StorageClient};
pub use error::{Error, Result, SessionError};
pub use record::{SessionAttributes, SessionId, SessionRecord, Version};
pub use runtime::SessionRuntime;
pub use session::{KvSessionStore, Session, SessionHandler};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::backend::KeyValueBackend;
use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::gc::Sweeper;
use crate::session::{KvSessionStore, SessionHandler};

/// Startup and teardown of the session store.
///
/// Build one at process start and pass [`SessionRuntime::handler`] into the
/// request pipeline. Starting with GC enabled spawns a sweeper, so it must
/// happen inside a tokio runtime.
pub struct SessionRuntime<B> {
    config: StoreConfig,
    store: Arc<KvSessionStore<B>>,
    sweeper: Option<Sweeper>,
}

impl<B: KeyValueBackend + 'static> SessionRuntime<B> {
    pub fn start(config: StoreConfig, backend: B) -> Result<Self> {
        Self::start_with_clock(config, backend, Arc::new(SystemClock))
    }

    pub fn start_with_clock(config: StoreConfig, backend: B, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(KvSessionStore::from_config(backend, clock, &config));

        let sweeper = config.gc.enabled.then(|| {
            Sweeper::spawn(store.clone(), Duration::from_secs(config.gc.interval_seconds))
        });

        info!(
            "Session store ready: table={} region={} ttl={}s consistency={:?} gc={}",
            config.table_name,
            config.table_region,
            config.default_ttl_seconds,
            config.consistency,
            config.gc.enabled
        );

        Ok(Self {
            config,
            store,
            sweeper,
        })
    }

    /// The handler the host's session middleware is built with.
    pub fn handler(&self) -> Arc<dyn SessionHandler> {
        self.store.clone()
    }

    pub fn store(&self) -> &Arc<KvSessionStore<B>> {
        &self.store
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.is_some()
    }

    /// Stop background work. Handlers already handed out keep working.
    pub async fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.shutdown().await;
        }
        info!("Session store shut down");
    }
}

#[cfg(feature = "dynamodb-backend")]
impl SessionRuntime<crate::backend::dynamo::DynamoBackend> {
    /// Start against the DynamoDB table named in `config`.
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let backend = crate::backend::dynamo::DynamoBackend::connect(&config).await;
        Self::start(config, backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::error::{ConfigError, Error};

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut config = StoreConfig::default();
        config.gc.enabled = true;
        config.gc.interval_seconds = 3600;

        let runtime = SessionRuntime::start(config, MemoryBackend::new()).unwrap();
        assert!(runtime.is_sweeping());

        let handler = runtime.handler();
        let id = handler.open("abc").unwrap();
        let mut session = handler.read(&id).await;
        session.insert("user", "alice");
        handler.close(&mut session).await.unwrap();

        runtime.shutdown().await;
        assert_eq!(handler.read(&id).await.get("user"), Some(&serde_json::json!("alice")));
    }

    #[test]
    fn test_start_rejects_bad_config() {
        let config = StoreConfig {
            table_name: String::new(),
            ..StoreConfig::default()
        };
        assert!(matches!(
            SessionRuntime::start(config, MemoryBackend::new()),
            Err(Error::Config(ConfigError::Invalid(_)))
        ));
    }
}

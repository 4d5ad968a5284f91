//! Expired-session sweeping.
//!
//! Sweeps run off the request path. Deletes are conditional on the row still
//! being expired, so any number of sweepers may run at once and a session
//! refreshed mid-sweep survives.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::backend::KeyValueBackend;
use crate::client::StorageClient;
use crate::session::{KvSessionStore, SessionHandler};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Expired ids handed out by the scan.
    pub scanned: u64,
    pub deleted: u64,
    /// Refreshed or already gone by the time we got to them.
    pub skipped: u64,
    pub failed: u64,
    /// Set when the scan itself broke off.
    pub aborted: Option<String>,
}

impl GcReport {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none() && self.failed == 0
    }
}

/// Walk every id that expired before `cutoff` and delete it.
///
/// Per-id failures are logged and counted. A failing scan ends the sweep.
pub async fn sweep<B: KeyValueBackend>(client: &StorageClient<B>, cutoff: DateTime<Utc>) -> GcReport {
    let mut report = GcReport::default();
    let ids = client.scan_expired(cutoff);
    futures::pin_mut!(ids);

    while let Some(next) = ids.next().await {
        let id = match next {
            Ok(id) => id,
            Err(e) => {
                warn!("GC scan aborted after {} ids: {}", report.scanned, e);
                report.aborted = Some(e.to_string());
                break;
            }
        };
        report.scanned += 1;
        match client.delete_expired(&id, cutoff).await {
            Ok(true) => report.deleted += 1,
            Ok(false) => report.skipped += 1,
            Err(e) => {
                warn!("GC failed to delete session {}: {}", id, e);
                report.failed += 1;
            }
        }
    }

    info!(
        "GC sweep done: scanned={} deleted={} skipped={} failed={}",
        report.scanned, report.deleted, report.skipped, report.failed
    );
    report
}

/// Periodic sweeper running as a background task.
///
/// Stops when [`Sweeper::shutdown`] is called or the handle is dropped. An
/// in-flight sweep is abandoned on shutdown.
pub struct Sweeper {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn onto the current tokio runtime. The first sweep starts right away.
    pub fn spawn<B>(store: Arc<KvSessionStore<B>>, interval: Duration) -> Self
    where
        B: KeyValueBackend + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("GC sweeper started, every {:?}", interval);
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = async {
                        ticker.tick().await;
                        let cutoff = store.client().now();
                        store.garbage_collect(cutoff).await;
                    } => {}
                }
            }
            info!("GC sweeper stopped");
        });
        Self { stop, handle }
    }

    /// Signal the task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!("GC sweeper task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::clock::{Clock, ManualClock};
    use crate::config::StoreConfig;

    fn store(page_size: u32) -> (Arc<KvSessionStore<MemoryBackend>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let mut cfg = StoreConfig::default();
        cfg.gc.page_size = page_size;
        cfg.retry.max_attempts = 1;
        let store = KvSessionStore::from_config(MemoryBackend::new(), clock.clone(), &cfg);
        (Arc::new(store), clock)
    }

    async fn seed(store: &KvSessionStore<MemoryBackend>, id: &str, ttl: i64) {
        let id = store.open(id).unwrap();
        let mut session = store.read(&id).await;
        session.insert("k", "v");
        store.write(&mut session, ttl).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_expired_across_pages() {
        let (store, clock) = store(2);
        for i in 0..7 {
            seed(&store, &format!("short{i}"), 10).await;
        }
        seed(&store, "long", 3600).await;

        clock.advance(chrono::Duration::seconds(60));
        let report = store.garbage_collect(clock.now()).await;
        assert_eq!(report.scanned, 7);
        assert_eq!(report.deleted, 7);
        assert!(report.is_complete());
        assert_eq!(store.client().backend().len(), 1);

        // A second run has nothing left to do.
        let again = store.garbage_collect(clock.now()).await;
        assert_eq!(again, GcReport::default());
    }

    #[tokio::test]
    async fn test_sweep_scan_failure_is_reported() {
        let (store, clock) = store(10);
        seed(&store, "a", 1).await;
        clock.advance(chrono::Duration::seconds(5));

        store.client().backend().fail_next(1);
        let report = store.garbage_collect(clock.now()).await;
        assert!(report.aborted.is_some());
        assert_eq!(report.deleted, 0);
        assert_eq!(store.client().backend().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_and_stops() {
        let (store, clock) = store(10);
        seed(&store, "a", 1).await;
        clock.advance(chrono::Duration::seconds(5));

        let sweeper = Sweeper::spawn(store.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.client().backend().is_empty());

        seed(&store, "b", 1).await;
        clock.advance(chrono::Duration::seconds(5));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.client().backend().len(), 1);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(store.client().backend().is_empty());

        sweeper.shutdown().await;
    }
}

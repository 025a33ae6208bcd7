//! Dirty-record flushing and the background write-back loop

use crate::audit::{ACTION_SYNC, AuditEvent};
use crate::storage::StorageInner;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shortest period the background loop will tick at
const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of one flush cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Backend the cycle flushed to, `None` if no primary is registered
    pub backend: Option<String>,
    /// Keys written and marked clean
    pub synced: Vec<String>,
    /// Keys written, but rewritten in the cache meanwhile; still dirty
    pub overtaken: Vec<String>,
    /// Keys whose write failed; retried next cycle
    pub failed: Vec<String>,
}

impl SyncReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.synced.is_empty() && self.overtaken.is_empty() && self.failed.is_empty()
    }
}

impl StorageInner {
    /// Write every dirty record to the primary backend.
    ///
    /// Records are snapshotted with their write generation under the state
    /// lock; the dirty mark is only cleared if no newer write landed while
    /// the backend call was in flight.
    pub(crate) async fn flush_dirty(&self) -> SyncReport {
        let mut report = SyncReport::default();
        let keys = self.state.lock().dirty_keys();
        if keys.is_empty() {
            return report;
        }

        let Some((name, backend)) = self.primary() else {
            debug!("{} dirty records held, no primary backend registered", keys.len());
            return report;
        };
        report.backend = Some(name.clone());

        for key in keys {
            let _guard = self.key_locks.lock(&key).await;
            let snapshot = self.state.lock().snapshot(&key);
            let Some((fields, generation)) = snapshot else {
                continue;
            };

            match backend.store_data(&key, &fields).await {
                Ok(true) => {
                    let cleaned = self.state.lock().mark_clean(&key, generation);
                    self.audit
                        .log(&key, AuditEvent::new(ACTION_SYNC).context("backend", name.as_str()));
                    if cleaned {
                        report.synced.push(key);
                    } else {
                        debug!("Record {key} changed during sync, keeping it dirty");
                        report.overtaken.push(key);
                    }
                }
                Ok(false) => {
                    warn!("Backend {name} declined write of {key}");
                    report.failed.push(key);
                }
                Err(e) => {
                    warn!("Failed to sync {key} to {name}: {e}");
                    report.failed.push(key);
                }
            }
        }

        if !report.synced.is_empty() || !report.failed.is_empty() {
            info!(
                "Synced {}/{} dirty records to {}",
                report.synced.len(),
                report.synced.len() + report.overtaken.len() + report.failed.len(),
                name
            );
        }
        report
    }
}

/// Long-running background task: flush dirty records every `interval`
async fn sync_loop(inner: Arc<StorageInner>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
        inner.flush_dirty().await;
    }

    debug!("Background sync loop stopped");
}

/// Handle to a running background sync loop
pub(crate) struct SyncTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncTask {
    pub(crate) fn spawn(runtime: &Handle, inner: Arc<StorageInner>, interval: Duration) -> Self {
        if interval < MIN_SYNC_INTERVAL {
            warn!("Sync interval {interval:?} too short, using {MIN_SYNC_INTERVAL:?}");
        }
        let interval = interval.max(MIN_SYNC_INTERVAL);
        let (shutdown, rx) = watch::channel(false);
        let handle = runtime.spawn(sync_loop(inner, interval, rx));
        info!("Started background sync every {interval:?}");
        Self { shutdown, handle }
    }

    /// Signal the loop and wait for an in-flight cycle to finish
    pub(crate) async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.handle.await
            && !e.is_cancelled()
        {
            warn!("Background sync task failed: {e}");
        }
    }

    pub(crate) fn abort(&self) {
        self.handle.abort();
    }
}

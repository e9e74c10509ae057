//! Deferred durability. Trackers mutate in memory and mark keys dirty; a
//! background flusher serialises the latest state of each dirty key and
//! writes it through the [`StateStore`] off the decision path.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PersistenceConfig;
use crate::store::{RecordKind, StateStore};

/// Set of `(kind, key)` pairs whose in-memory state is newer than the store.
pub struct PersistenceQueue {
    dirty: Mutex<BTreeSet<(RecordKind, String)>>,
    wake_threshold: usize,
    wake_tx: flume::Sender<()>,
    wake_rx: flume::Receiver<()>,
}

impl PersistenceQueue {
    pub fn new() -> Self {
        Self::with_wake_threshold(PersistenceConfig::default().wake_threshold)
    }

    /// Wakes the flusher early once `threshold` keys are pending (0 never).
    pub fn with_wake_threshold(threshold: usize) -> Self {
        let (wake_tx, wake_rx) = flume::bounded(1);
        Self {
            dirty: Mutex::new(BTreeSet::new()),
            wake_threshold: threshold,
            wake_tx,
            wake_rx,
        }
    }

    pub fn mark_dirty(&self, kind: RecordKind, key: &str) {
        let pending = {
            let mut dirty = self.dirty.lock();
            dirty.insert((kind, key.to_string()));
            dirty.len()
        };
        if self.wake_threshold > 0 && pending >= self.wake_threshold {
            self.wake();
        }
    }

    /// Puts a key back after a failed write. Never wakes the flusher, so a
    /// failing store is retried on the interval rather than in a tight loop.
    fn requeue(&self, kind: RecordKind, key: &str) {
        self.dirty.lock().insert((kind, key.to_string()));
    }

    pub fn len(&self) -> usize {
        self.dirty.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.lock().is_empty()
    }

    pub fn drain(&self) -> Vec<(RecordKind, String)> {
        std::mem::take(&mut *self.dirty.lock()).into_iter().collect()
    }

    /// Asks the flusher for an early pass; a pending wake is enough.
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub fn wake_signal(&self) -> flume::Receiver<()> {
        self.wake_rx.clone()
    }
}

impl Default for PersistenceQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Something that can serialise its current in-memory record for a key.
pub trait RecordSource: Send + Sync {
    fn kind(&self) -> RecordKind;
    fn encode(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Flusher {
    store: Arc<dyn StateStore>,
    queue: Arc<PersistenceQueue>,
    sources: Vec<Arc<dyn RecordSource>>,
    retry_attempts: u32,
    retry_base: Duration,
}

impl Flusher {
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<PersistenceQueue>,
        sources: Vec<Arc<dyn RecordSource>>,
        config: &PersistenceConfig,
    ) -> Self {
        Self {
            store,
            queue,
            sources,
            retry_attempts: config.retry_attempts.max(1),
            retry_base: Duration::from_millis(config.retry_base_ms),
        }
    }

    pub fn queue(&self) -> &Arc<PersistenceQueue> {
        &self.queue
    }

    fn source_for(&self, kind: RecordKind) -> Option<&Arc<dyn RecordSource>> {
        self.sources.iter().find(|source| source.kind() == kind)
    }

    /// Writes every dirty record. Blocking: run it on a blocking thread.
    /// Records that still fail after all retries go back on the queue.
    pub fn flush_now(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for (kind, key) in self.queue.drain() {
            let Some(source) = self.source_for(kind) else {
                report.skipped += 1;
                continue;
            };
            let Some(payload) = source.encode(&key) else {
                report.skipped += 1;
                continue;
            };
            if self.save_with_retry(kind, &key, &payload) {
                report.written += 1;
            } else {
                report.failed += 1;
                self.queue.requeue(kind, &key);
            }
        }
        if report.written > 0 || report.failed > 0 {
            tracing::debug!(
                "Flushed {} record(s) to {} ({} failed, {} skipped)",
                report.written,
                self.store.backend_name(),
                report.failed,
                report.skipped
            );
        }
        report
    }

    fn save_with_retry(&self, kind: RecordKind, key: &str, payload: &str) -> bool {
        let mut delay = self.retry_base;
        for attempt in 1..=self.retry_attempts {
            match self.store.save(kind, key, payload) {
                Ok(()) => return true,
                Err(e) if attempt < self.retry_attempts => {
                    tracing::warn!(
                        "Persisting {} '{}' failed (attempt {}/{}): {}",
                        kind.as_str(),
                        key,
                        attempt,
                        self.retry_attempts,
                        e
                    );
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    tracing::error!(
                        "Giving up on {} '{}' after {} attempt(s): {:#}",
                        kind.as_str(),
                        key,
                        attempt,
                        e
                    );
                }
            }
        }
        false
    }

    /// Periodic flush loop. Exits after a final flush once `shutdown`
    /// fires or its sender is dropped.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: flume::Receiver<()>) {
        let wake = self.queue.wake_signal();
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wake.recv_async() => {}
                _ = shutdown.recv_async() => break,
            }
            if self.queue.is_empty() {
                continue;
            }
            let flusher = self.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || flusher.flush_now()).await {
                tracing::error!("Flush task panicked: {}", e);
            }
        }
        let flusher = self.clone();
        match tokio::task::spawn_blocking(move || flusher.flush_now()).await {
            Ok(report) => tracing::info!("Final flush wrote {} record(s)", report.written),
            Err(e) => tracing::error!("Final flush panicked: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;
    use anyhow::Result;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedSource {
        values: HashMap<String, String>,
    }

    impl RecordSource for FixedSource {
        fn kind(&self) -> RecordKind {
            RecordKind::Activity
        }

        fn encode(&self, key: &str) -> Option<String> {
            self.values.get(key).cloned()
        }
    }

    fn source() -> Arc<dyn RecordSource> {
        let mut values = HashMap::new();
        values.insert("general".to_string(), "{\"n\":1}".to_string());
        Arc::new(FixedSource { values })
    }

    /// Fails the first `failures` saves, then delegates to memory.
    struct FlakyStore {
        failures: AtomicU32,
        inner: MemoryStateStore,
    }

    impl StateStore for FlakyStore {
        fn backend_name(&self) -> &'static str {
            "flaky"
        }

        fn load(&self, kind: RecordKind, key: &str) -> Result<Option<String>> {
            self.inner.load(kind, key)
        }

        fn save(&self, kind: RecordKind, key: &str, payload: &str) -> Result<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("disk unavailable");
            }
            self.inner.save(kind, key, payload)
        }

        fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
            self.inner.delete(kind, key)
        }

        fn list_keys(&self, kind: RecordKind) -> Result<Vec<String>> {
            self.inner.list_keys(kind)
        }
    }

    fn config() -> PersistenceConfig {
        PersistenceConfig {
            retry_attempts: 3,
            retry_base_ms: 1,
            ..PersistenceConfig::default()
        }
    }

    #[test]
    fn dirty_keys_are_written_once() {
        let store = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(PersistenceQueue::new());
        let flusher = Flusher::new(store.clone(), queue.clone(), vec![source()], &config());
        queue.mark_dirty(RecordKind::Activity, "general");
        queue.mark_dirty(RecordKind::Activity, "general");
        queue.mark_dirty(RecordKind::Activity, "unknown");

        let report = flusher.flush_now();
        assert_eq!(report.written, 1);
        assert_eq!(report.skipped, 1);
        assert!(queue.is_empty());
        assert_eq!(
            store.load(RecordKind::Activity, "general").expect("load"),
            Some("{\"n\":1}".to_string())
        );
    }

    #[test]
    fn transient_failures_are_retried() {
        let store = Arc::new(FlakyStore {
            failures: AtomicU32::new(2),
            inner: MemoryStateStore::new(),
        });
        let queue = Arc::new(PersistenceQueue::new());
        let flusher = Flusher::new(store.clone(), queue.clone(), vec![source()], &config());
        queue.mark_dirty(RecordKind::Activity, "general");
        assert_eq!(flusher.flush_now().written, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn exhausted_retries_requeue_the_key() {
        let store = Arc::new(FlakyStore {
            failures: AtomicU32::new(10),
            inner: MemoryStateStore::new(),
        });
        let queue = Arc::new(PersistenceQueue::with_wake_threshold(1));
        let wake = queue.wake_signal();
        let flusher = Flusher::new(store, queue.clone(), vec![source()], &config());
        queue.mark_dirty(RecordKind::Activity, "general");
        assert!(wake.try_recv().is_ok());
        let report = flusher.flush_now();
        assert_eq!(report.failed, 1);
        assert_eq!(queue.len(), 1);
        assert!(wake.try_recv().is_err());
    }

    #[test]
    fn backlog_past_threshold_wakes_the_flusher() {
        let queue = PersistenceQueue::with_wake_threshold(2);
        let wake = queue.wake_signal();
        queue.mark_dirty(RecordKind::Activity, "general");
        queue.mark_dirty(RecordKind::Activity, "general");
        assert!(wake.try_recv().is_err());
        queue.mark_dirty(RecordKind::Activity, "random");
        assert!(wake.try_recv().is_ok());

        let quiet = PersistenceQueue::with_wake_threshold(0);
        let wake = quiet.wake_signal();
        for key in ["a", "b", "c"] {
            quiet.mark_dirty(RecordKind::Activity, key);
        }
        assert!(wake.try_recv().is_err());
    }

    #[tokio::test]
    async fn wake_flushes_before_the_interval() {
        let store = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(PersistenceQueue::with_wake_threshold(1));
        let flusher = Arc::new(Flusher::new(
            store.clone(),
            queue.clone(),
            vec![source()],
            &config(),
        ));
        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        let handle = tokio::spawn(flusher.run(Duration::from_secs(3600), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        queue.mark_dirty(RecordKind::Activity, "general");
        let mut written = false;
        for _ in 0..100 {
            if store.load(RecordKind::Activity, "general").expect("load").is_some() {
                written = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(written, "flusher did not wake");

        shutdown_tx.send(()).expect("send shutdown");
        handle.await.expect("flusher task");
    }

    #[tokio::test]
    async fn run_loop_flushes_on_shutdown() {
        let store = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(PersistenceQueue::new());
        let flusher = Arc::new(Flusher::new(
            store.clone(),
            queue.clone(),
            vec![source()],
            &config(),
        ));
        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        let handle = tokio::spawn(flusher.run(Duration::from_secs(3600), shutdown_rx));

        queue.mark_dirty(RecordKind::Activity, "general");
        shutdown_tx.send(()).expect("send shutdown");
        handle.await.expect("flusher task");

        assert!(store
            .load(RecordKind::Activity, "general")
            .expect("load")
            .is_some());
    }
}

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// A stored value together with its unix-seconds expiry.
///
/// An entry is live while `now < exp` and stale from `now >= exp` onward.
/// The cache itself never enforces liveness on read: some callers treat a
/// stale entry as a miss, others need to see it to decide what to do next,
/// so the comparison belongs to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<V> {
    pub value: V,
    pub exp: i64,
}

/// Concurrent string-keyed cache with a periodic background sweep.
///
/// Writes are last-writer-wins per key. The sweeper iterates shard by shard
/// (DashMap `retain`), so readers are never blocked for a full scan.
/// `shutdown` stops the sweeper deterministically.
pub struct ExpiryCache<V> {
    entries: Arc<DashMap<String, CacheEntry<V>>>,
    stop: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V> ExpiryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create the cache and start its sweeper at the given interval.
    pub fn new(clean_interval: Duration) -> Self {
        let entries: Arc<DashMap<String, CacheEntry<V>>> = Arc::new(DashMap::new());
        let (stop, mut stopped) = watch::channel(false);

        let sweep_target = entries.clone();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(clean_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let before = sweep_target.len();
                        let now = unix_now();
                        sweep_target.retain(|_, entry| entry.exp > now);
                        let removed = before.saturating_sub(sweep_target.len());
                        if removed > 0 {
                            tracing::debug!(removed, remaining = sweep_target.len(), "swept expired cache entries");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
        });

        Self {
            entries,
            stop,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Return the raw entry for `key`, including its expiry. Stale entries
    /// are returned as-is until the sweeper removes them.
    pub fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Unconditionally store `entry` under `key`, overwriting any previous
    /// value.
    pub fn set(&self, key: &str, entry: CacheEntry<V>) {
        self.entries.insert(key.to_string(), entry);
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.sweeper.lock().await.take() {
            let _ = handle.await;
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Deduplicates concurrent async work by key.
///
/// The first caller for a key becomes the leader and runs the work; callers
/// arriving while it is in flight wait on the same cell and receive a clone
/// of the leader's result. A failed leader leaves the cell unfilled, so the
/// next waiter retries with its own work closure. Entries are dropped once
/// settled: single-flight only collapses the in-flight window, longer-term
/// reuse belongs to a cache in front of it.
pub struct SingleFlight<V> {
    inflight: DashMap<String, Arc<OnceCell<V>>>,
}

impl<V> SingleFlight<V>
where
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Run `work` for `key`, or wait for the in-flight run of it.
    pub async fn run<E, F, Fut>(&self, key: &str, work: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self
            .inflight
            .entry(key.to_string())
            .or_default()
            .clone();
        let result = cell.get_or_try_init(work).await.cloned();
        // Only retire the generation we joined; a later caller may already
        // have installed a fresh cell under the same key.
        self.inflight
            .remove_if(key, |_, current| Arc::ptr_eq(current, &cell));
        result
    }
}

impl<V> Default for SingleFlight<V>
where
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

//! In-flight request collapsing.
//!
//! N concurrent requests for the same block fingerprint collapse into one
//! build: whoever wins the map slot runs the computation, every other
//! waiter joins its result. Entries are dropped once the build resolves,
//! so this caches work, not data.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

/// Fingerprint of a block-data request.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct BlockFingerprint {
    /// Height rendered as decimal or hash rendered as hex.
    pub key: String,
    pub include_transactions: bool,
}

/// Collapses concurrent builds per key. `V` must be cheap to clone; block
/// responses are `Arc`ed or small.
pub struct InflightCache<K, V> {
    inner: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> std::fmt::Debug for InflightCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightCache").finish_non_exhaustive()
    }
}

impl<K, V> Default for InflightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> InflightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `build` unless a build for `key` is already in flight, in
    /// which case the caller awaits that one. Insertion races are resolved
    /// by whoever wins the slot; everyone gets the same result.
    pub async fn get_or_build<E, F, Fut>(&self, key: K, build: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut inner = self.inner.lock();
            inner
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell.get_or_try_init(build).await.cloned();

        // In-flight only: the slot is released once resolved so later
        // requests observe fresh data.
        self.inner.lock().remove(&key);
        result
    }

    /// Number of builds currently in flight.
    pub fn inflight_len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_concurrent_requests_share_one_build() {
        let cache = Arc::new(InflightCache::<u64, String>::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let builds = builds.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_build(7, || {
                        let builds = builds.clone();
                        async move {
                            builds.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, ()>("block-7".to_string())
                        }
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "block-7");
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_build_separately() {
        let cache = InflightCache::<BlockFingerprint, u32>::new();

        let with_txs = BlockFingerprint {
            key: "42".into(),
            include_transactions: true,
        };
        let without = BlockFingerprint {
            key: "42".into(),
            include_transactions: false,
        };

        let a = cache
            .get_or_build(with_txs, || async { Ok::<_, ()>(1) })
            .await
            .unwrap();
        let b = cache
            .get_or_build(without, || async { Ok::<_, ()>(2) })
            .await
            .unwrap();
        assert_eq!((a, b), (1, 2));
    }

    #[tokio::test]
    async fn test_failed_build_releases_slot() {
        let cache = InflightCache::<u64, u32>::new();

        let failed: Result<u32, &str> = cache.get_or_build(1, || async { Err("boom") }).await;
        assert!(failed.is_err());

        // A later build for the same key runs fresh.
        let ok = cache.get_or_build(1, || async { Ok::<_, &str>(9) }).await;
        assert_eq!(ok, Ok(9));
    }
}

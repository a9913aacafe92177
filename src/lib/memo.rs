//! Memoisation of async computations by request value.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

/// Caches the result of an async computation per key.
///
/// Concurrent callers asking for an equal key share a single in-flight computation and all
/// observe the same value. Errors are values too: a failed computation is not retried within the
/// lifetime of the `Memo`.
pub struct Memo<K, V> {
    cells: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for Memo<K, V> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Memo<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the value for `key`, running `compute` only if no other caller has started it.
    pub async fn get_or_compute<F, Fut>(&self, key: &K, compute: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            cells.entry(key.clone()).or_default().clone()
        };
        cell.get_or_init(compute).await.clone()
    }

    /// The completed value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Number of keys that have been requested.
    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> std::fmt::Debug for Memo<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self
            .cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("Memo").field("keys", &len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let memo: Memo<String, u32> = Memo::new();
        let runs = AtomicUsize::new(0);
        let key = "a".to_string();
        let compute = || async {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            7
        };
        let (first, second) = tokio::join!(
            memo.get_or_compute(&key, compute),
            memo.get_or_compute(&key, compute)
        );
        assert_eq!((first, second), (7, 7));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(memo.get(&key), Some(7));
    }

    #[tokio::test]
    async fn distinct_keys_compute_separately() {
        let memo: Memo<u8, u8> = Memo::new();
        assert_eq!(memo.get_or_compute(&1, || async { 10 }).await, 10);
        assert_eq!(memo.get_or_compute(&2, || async { 20 }).await, 20);
        assert_eq!(memo.get_or_compute(&1, || async { 99 }).await, 10);
        assert_eq!(memo.len(), 2);
    }

    #[tokio::test]
    async fn errors_are_memoised() {
        let memo: Memo<u8, Result<u8, String>> = Memo::new();
        let runs = AtomicUsize::new(0);
        for _ in 0..3 {
            let result = memo
                .get_or_compute(&1, || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                })
                .await;
            assert_eq!(result, Err("boom".to_string()));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}

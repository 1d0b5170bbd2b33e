//! Thread-safe memoizing cache
//!
//! One entry per key. Readers take the shared lock, the factory runs under
//! the exclusive lock after a second lookup so it executes at most once per
//! key. Factories must not call back into the same cache.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::RwLock;

pub struct MemoizingCache<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for MemoizingCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MemoizingCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Stored value for `key`, or the factory's result which is then stored.
    pub fn compute_if_absent<F>(&self, key: K, factory: F) -> V
    where
        F: FnOnce(&K) -> V,
    {
        if let Some(v) = self.entries.read().get(&key) {
            return v.clone();
        }

        let mut entries = self.entries.write();
        if let Some(v) = entries.get(&key) {
            return v.clone();
        }
        let value = factory(&key);
        entries.insert(key, value.clone());
        value
    }

    /// Like [`compute_if_absent`](Self::compute_if_absent); a failed factory
    /// stores nothing and the next call retries.
    pub fn try_compute_if_absent<F, E>(&self, key: K, factory: F) -> Result<V, E>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        if let Some(v) = self.entries.read().get(&key) {
            return Ok(v.clone());
        }

        let mut entries = self.entries.write();
        if let Some(v) = entries.get(&key) {
            return Ok(v.clone());
        }
        let value = factory(&key)?;
        entries.insert(key, value.clone());
        Ok(value)
    }

    #[inline]
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_compute_once() {
        let cache = MemoizingCache::new();
        let calls = AtomicUsize::new(0);

        let a = cache.compute_if_absent("k", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            42
        });
        let b = cache.compute_if_absent("k", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            7
        });

        assert_eq!((a, b), (42, 42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&"k"), Some(42));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_factory_not_stored() {
        let cache: MemoizingCache<u32, u32> = MemoizingCache::new();
        let err: Result<u32, &str> = cache.try_compute_if_absent(1, |_| Err("nope"));
        assert_eq!(err, Err("nope"));
        assert!(cache.is_empty());

        let ok: Result<u32, &str> = cache.try_compute_if_absent(1, |k| Ok(k + 10));
        assert_eq!(ok, Ok(11));
        assert_eq!(cache.get(&1), Some(11));
    }

    #[test]
    fn test_concurrent_single_factory_call() {
        const THREADS: usize = 8;

        let cache = Arc::new(MemoizingCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.compute_if_absent(String::from("shared"), |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Arc::new(vec![1u8, 2, 3])
                    })
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for r in &results {
            assert!(Arc::ptr_eq(r, &results[0]));
        }
    }
}

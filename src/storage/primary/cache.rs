// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Process-wide caches of per-tablet objects.

use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::{Mutex, MutexGuard};

struct Entry<V> {
    value: Mutex<V>,
    /// Weight reported to the cache, in KiB.
    weight: AtomicU32,
}

/// A cache of mutable objects handed out through [`CacheHandle`]s.
pub struct ObjectCache<K, V> {
    cache: Cache<K, Arc<Entry<V>>>,
}

impl<K, V> ObjectCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    /// Entries not touched for `expire` are evicted.
    pub fn with_expire(expire: Duration) -> Self {
        let cache = Cache::builder()
            .time_to_idle(expire)
            .weigher(|_, entry: &Arc<Entry<V>>| entry.weight.load(Ordering::Relaxed).max(1))
            .build();
        Self { cache }
    }

    /// At most `capacity` entries are kept.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            cache: Cache::new(capacity),
        }
    }

    /// Get the object for `key`, creating it with `init` on a miss.
    pub fn get_or_create(&self, key: K, init: impl FnOnce() -> V) -> CacheHandle<'_, K, V> {
        let entry = self.cache.get_with(key.clone(), || {
            Arc::new(Entry {
                value: Mutex::new(init()),
                weight: AtomicU32::new(1),
            })
        });
        CacheHandle {
            cache: self,
            key,
            entry,
            removed: false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.cache.contains_key(key)
    }

    /// Evict `key` without a handle.
    pub fn remove_by_key(&self, key: &K) {
        self.cache.invalidate(key);
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

/// Scoped access to a cached object. Dropping the handle releases it.
pub struct CacheHandle<'a, K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    cache: &'a ObjectCache<K, V>,
    key: K,
    entry: Arc<Entry<V>>,
    removed: bool,
}

impl<'a, K, V> CacheHandle<'a, K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    pub fn lock(&self) -> MutexGuard<'_, V> {
        self.entry.value.lock()
    }

    /// Record the memory used by the object, picked up on release.
    pub fn update_object_size(&self, bytes: usize) {
        let kib = (bytes / 1024).clamp(1, u32::MAX as usize) as u32;
        self.entry.weight.store(kib, Ordering::Relaxed);
    }

    /// Return the object to the cache, where it stays until it expires.
    pub fn release(self) {}

    /// Evict the object. Used when it may hold inconsistent state.
    pub fn remove(mut self) {
        self.removed = true;
        self.cache.cache.invalidate(&self.key);
    }
}

impl<'a, K, V> Drop for CacheHandle<'a, K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        // re-insert so the cache sees the new weight, unless another handle replaced it
        let current = self.cache.cache.get(&self.key);
        if current.map_or(true, |e| Arc::ptr_eq(&e, &self.entry)) {
            self.cache.cache.insert(self.key.clone(), self.entry.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_keeps_object() {
        let cache = ObjectCache::<u64, Vec<u32>>::with_expire(Duration::from_secs(60));
        let handle = cache.get_or_create(1, Vec::new);
        handle.lock().push(7);
        handle.update_object_size(4096);
        handle.release();

        let handle = cache.get_or_create(1, || unreachable!());
        assert_eq!(*handle.lock(), vec![7]);
    }

    #[test]
    fn test_remove_evicts_object() {
        let cache = ObjectCache::<u64, Vec<u32>>::with_capacity(4);
        {
            let handle = cache.get_or_create(1, Vec::new);
            handle.lock().push(7);
            handle.remove();
        }
        assert!(!cache.contains(&1));
        let handle = cache.get_or_create(1, Vec::new);
        assert!(handle.lock().is_empty());
    }
}

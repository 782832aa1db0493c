//! Caches for remote lookups.
//!
//! [`ResourceCache`] lives for exactly one logical operation and is dropped
//! with it. [`SharedCatalog`] is the process-lifetime cache for large
//! paginated catalogs that concurrent operations would otherwise all walk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// A cached value and when it was fetched.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
}

/// Per-operation cache of remote entities and collections.
///
/// No TTL and no eviction; drop it when the operation ends.
#[derive(Debug)]
pub struct ResourceCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    fetches: usize,
}

impl<V> Default for ResourceCache<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            fetches: 0,
        }
    }
}

impl<V: Clone> ResourceCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Cached entry for `key`, including its insertion time.
    pub fn entry(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: impl Into<String>, value: V) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop `key` so the next lookup goes back to the remote service.
    pub fn invalidate(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Cached value for `key`, or the result of `fetch` (which is then cached).
    ///
    /// Errors are not cached.
    pub fn get_or_fetch<E, F>(&mut self, key: &str, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(value) = self.get(key) {
            log::trace!("cache hit: {key}");
            return Ok(value);
        }

        log::trace!("cache miss: {key}");
        self.fetches += 1;
        let value = fetch()?;
        self.put(key, value.clone());
        Ok(value)
    }

    /// Number of times `get_or_fetch` had to call its fetcher.
    pub fn fetch_count(&self) -> usize {
        self.fetches
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Process-lifetime cache for paginated catalogs, shared across operations.
///
/// Population is serialized: the lock is held while the populate callback
/// runs, so racing operations hydrate a catalog once.
#[derive(Debug)]
pub struct SharedCatalog<V> {
    entries: Mutex<HashMap<String, Arc<V>>>,
}

impl<V> Default for SharedCatalog<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> SharedCatalog<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.lock().get(key).cloned()
    }

    /// Cached catalog for `key`, populating it if absent.
    pub fn get_or_populate<E, F>(&self, key: &str, populate: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let mut entries = self.lock();
        if let Some(value) = entries.get(key) {
            return Ok(Arc::clone(value));
        }

        log::debug!("Populating catalog {key}");
        let value = Arc::new(populate()?);
        entries.insert(key.to_string(), Arc::clone(&value));
        Ok(value)
    }

    pub fn invalidate(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_second_get_does_not_refetch() {
        let mut cache: ResourceCache<Vec<String>> = ResourceCache::new();
        let mut fetched = 0;

        let first: Result<_, ()> = cache.get_or_fetch("skills", || {
            fetched += 1;
            Ok(vec!["Billing".to_string()])
        });
        let second: Result<_, ()> = cache.get_or_fetch("skills", || {
            fetched += 1;
            Ok(vec!["other".to_string()])
        });

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(fetched, 1);
        assert_eq!(cache.fetch_count(), 1);
        assert_eq!(cache.get("skills"), Some(vec!["Billing".to_string()]));
    }

    #[test]
    fn test_invalidate_forces_refetch() {
        let mut cache = ResourceCache::new();
        cache.put("user:u-1", 1);
        assert_eq!(cache.invalidate("user:u-1"), Some(1));
        assert!(cache.get("user:u-1").is_none());

        let value: Result<_, ()> = cache.get_or_fetch("user:u-1", || Ok(2));
        assert_eq!(value.unwrap(), 2);
        assert_eq!(cache.fetch_count(), 1);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let mut cache: ResourceCache<u8> = ResourceCache::new();
        assert!(cache.get_or_fetch("k", || Err("boom")).is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_fetch::<&str, _>("k", || Ok(3)), Ok(3));
        assert_eq!(cache.len(), 1);
        assert!(cache.entry("k").is_some());
    }

    #[test]
    fn test_shared_catalog_populates_once() {
        let catalog = Arc::new(SharedCatalog::<Vec<u32>>::new());
        let populated = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let catalog = Arc::clone(&catalog);
                let populated = Arc::clone(&populated);
                thread::spawn(move || {
                    catalog
                        .get_or_populate::<(), _>("divisions", || {
                            populated.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(5));
                            Ok(vec![1, 2, 3])
                        })
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(*handle.join().unwrap(), vec![1, 2, 3]);
        }
        assert_eq!(populated.load(Ordering::SeqCst), 1);

        catalog.invalidate("divisions");
        assert!(catalog.get("divisions").is_none());
    }
}

//! Bounded LRU cache with hit/miss accounting.
//!
//! Used for the enhancement response cache; keys are opaque fingerprints
//! supplied by the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub max_size: usize,
}

pub struct Cache<V> {
    max_size: usize,
    inner: Mutex<LruCache<String, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> Cache<V> {
    pub fn new(max_size: usize) -> Arc<Self> {
        let capacity = std::num::NonZeroUsize::new(max_size.max(1)).expect("max_size.max(1) > 0");
        Arc::new(Self {
            max_size,
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Look up `key`, promoting it to most-recently-used on a hit.
    pub async fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().await;
        match inner.get(key) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert `key`, evicting the least-recently-used entry first if the
    /// cache is already at capacity.
    pub async fn put(&self, key: String, value: V) {
        let mut inner = self.inner.lock().await;
        inner.put(key, value);
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: inner.len(),
            max_size: self.max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = Cache::new(4);
        assert_eq!(cache.get("a").await, None);
        cache.put("a".to_string(), 1).await;
        assert_eq!(cache.get("a").await, Some(1));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn evicts_least_recently_used_when_full() {
        let cache = Cache::new(2);
        cache.put("a".to_string(), 1).await;
        cache.put("b".to_string(), 2).await;
        // touch "a" so "b" becomes the least-recently-used entry
        assert_eq!(cache.get("a").await, Some(1));
        cache.put("c".to_string(), 3).await;

        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("a").await, Some(1));
        assert_eq!(cache.get("c").await, Some(3));

        let stats = cache.stats().await;
        assert_eq!(stats.size, 2);
        assert_eq!(stats.max_size, 2);
    }

    #[tokio::test]
    async fn never_exceeds_max_size() {
        let cache = Cache::new(3);
        for i in 0..10 {
            cache.put(format!("key-{i}"), i).await;
        }
        assert!(cache.stats().await.size <= 3);
    }
}

//! Bounded in-memory cache with least-recently-used eviction.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::cache::{Cache, CacheCounters, CacheEntry, CacheStats};
use crate::error::EngineError;

/// In-memory backend. Entries live in an ordered map whose front is the
/// least-recently-used key; a hit moves the key to the back, an insert past
/// `max_size` evicts from the front. TTLs are checked on read.
pub struct MemoryCache {
    max_size: usize,
    default_ttl: Option<u64>,
    entries: Mutex<IndexMap<String, CacheEntry>>,
    counters: CacheCounters,
}

impl MemoryCache {
    pub fn new(max_size: usize, default_ttl: Option<u64>) -> Self {
        MemoryCache {
            max_size: max_size.max(1),
            default_ttl,
            entries: Mutex::new(IndexMap::new()),
            counters: CacheCounters::default(),
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, EngineError> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get(key).cloned() else {
            self.counters.miss();
            return Ok(None);
        };
        if entry.is_expired() {
            entries.shift_remove(key);
            self.counters.expired_removal();
            self.counters.miss();
            return Ok(None);
        }
        // Refresh recency: re-inserting moves the key to the back.
        entries.shift_remove(key);
        entries.insert(key.to_string(), entry.clone());
        self.counters.hit();
        Ok(Some(entry))
    }

    async fn put(
        &self,
        key: &str,
        value: &Value,
        ttl_seconds: Option<u64>,
    ) -> Result<(), EngineError> {
        let entry = CacheEntry::new(value.clone(), ttl_seconds.or(self.default_ttl));
        let mut entries = self.entries.lock().await;
        entries.shift_remove(key);
        entries.insert(key.to_string(), entry);
        while entries.len() > self.max_size {
            entries.shift_remove_index(0);
            self.counters.eviction();
        }
        self.counters.put();
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<bool, EngineError> {
        let mut entries = self.entries.lock().await;
        Ok(entries.shift_remove(key).is_some())
    }

    async fn clear(&self) -> Result<(), EngineError> {
        self.entries.lock().await.clear();
        self.counters.reset();
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize, EngineError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        let removed = before - entries.len();
        for _ in 0..removed {
            self.counters.expired_removal();
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats, EngineError> {
        let size = self.entries.lock().await.len();
        Ok(self.counters.snapshot(self.backend(), size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn hit_miss_and_counters() {
        let cache = MemoryCache::new(10, None);
        assert!(cache.get("k").await.unwrap().is_none());
        cache.put("k", &json!({"v": 1}), None).await.unwrap();
        let entry = cache.get("k").await.unwrap().expect("entry");
        assert_eq!(entry.value, json!({"v": 1}));
        let stats = cache.stats().await.unwrap();
        assert_eq!((stats.hits, stats.misses, stats.puts, stats.size), (1, 1, 1, 1));
    }

    #[tokio::test]
    async fn lru_eviction_on_insert() {
        let cache = MemoryCache::new(2, None);
        cache.put("a", &json!(1), None).await.unwrap();
        cache.put("b", &json!(2), None).await.unwrap();
        // Touch "a" so "b" becomes the eviction candidate.
        cache.get("a").await.unwrap();
        cache.put("c", &json!(3), None).await.unwrap();
        assert!(cache.get("a").await.unwrap().is_some());
        assert!(cache.get("b").await.unwrap().is_none());
        assert!(cache.get("c").await.unwrap().is_some());
        assert_eq!(cache.stats().await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn expired_entries_read_as_misses() {
        let cache = MemoryCache::new(10, None);
        cache.put("k", &json!(1), Some(60)).await.unwrap();
        {
            let mut entries = cache.entries.lock().await;
            entries.get_mut("k").unwrap().expires_at =
                Some(Utc::now() - ChronoDuration::seconds(5));
        }
        assert!(cache.get("k").await.unwrap().is_none());
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.expired_removals, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn cleanup_expired_reports_count() {
        let cache = MemoryCache::new(10, None);
        cache.put("live", &json!(1), None).await.unwrap();
        cache.put("dead", &json!(2), Some(60)).await.unwrap();
        {
            let mut entries = cache.entries.lock().await;
            entries.get_mut("dead").unwrap().expires_at =
                Some(Utc::now() - ChronoDuration::seconds(5));
        }
        assert_eq!(cache.cleanup_expired().await.unwrap(), 1);
        assert_eq!(cache.stats().await.unwrap().size, 1);
    }
}

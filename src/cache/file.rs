//! Directory-backed cache: one JSON file per key, written atomically.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::cache::{sha256_hex, Cache, CacheCounters, CacheEntry, CacheStats};
use crate::error::{EngineError, ErrorKind};

const ENTRY_EXTENSION: &str = "json";

/// File-backed cache. Keys hash to filenames under `cache_dir`; writes go to
/// a temp file first and are renamed into place so readers never observe a
/// partial entry. Corrupt entries are removed and read as misses.
pub struct FileCache {
    cache_dir: PathBuf,
    default_ttl: Option<u64>,
    counters: CacheCounters,
    // Serializes directory-wide operations (clear, cleanup) against writes.
    dir_lock: Mutex<()>,
}

impl FileCache {
    pub fn new(cache_dir: PathBuf, default_ttl: Option<u64>) -> Result<Self, EngineError> {
        fs::create_dir_all(&cache_dir).map_err(|err| {
            EngineError::new(
                ErrorKind::CacheBackend,
                format!("failed to create cache dir {}: {}", cache_dir.display(), err),
            )
        })?;
        Ok(FileCache {
            cache_dir,
            default_ttl,
            counters: CacheCounters::default(),
            dir_lock: Mutex::new(()),
        })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{}", sha256_hex(key.as_bytes()), ENTRY_EXTENSION))
    }

    fn read_entry(&self, path: &Path) -> Option<CacheEntry> {
        let bytes = fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(entry) => Some(entry),
            Err(_) => {
                self.counters.error();
                let _ = fs::remove_file(path);
                None
            }
        }
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>, EngineError> {
        let mut files = Vec::new();
        let reader = fs::read_dir(&self.cache_dir).map_err(|err| {
            EngineError::new(
                ErrorKind::CacheBackend,
                format!("failed to read cache dir {}: {}", self.cache_dir.display(), err),
            )
        })?;
        for item in reader {
            let path = item
                .map_err(|err| {
                    EngineError::new(
                        ErrorKind::CacheBackend,
                        format!("failed to scan cache dir: {}", err),
                    )
                })?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(ENTRY_EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), EngineError> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data).map_err(|err| {
        EngineError::new(
            ErrorKind::CacheBackend,
            format!("failed to write {}: {}", tmp_path.display(), err),
        )
    })?;
    fs::rename(&tmp_path, path).map_err(|err| {
        EngineError::new(
            ErrorKind::CacheBackend,
            format!(
                "failed to rename {} -> {}: {}",
                tmp_path.display(),
                path.display(),
                err
            ),
        )
    })
}

#[async_trait]
impl Cache for FileCache {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, EngineError> {
        let path = self.entry_path(key);
        let Some(entry) = self.read_entry(&path) else {
            self.counters.miss();
            return Ok(None);
        };
        if entry.is_expired() {
            let _ = fs::remove_file(&path);
            self.counters.expired_removal();
            self.counters.miss();
            return Ok(None);
        }
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
        let bytes = serde_json::to_vec_pretty(&entry).map_err(|err| {
            EngineError::new(
                ErrorKind::CacheBackend,
                format!("failed to serialize cache entry: {}", err),
            )
        })?;
        let _guard = self.dir_lock.lock().await;
        atomic_write(&self.entry_path(key), &bytes)?;
        self.counters.put();
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<bool, EngineError> {
        let _guard = self.dir_lock.lock().await;
        let path = self.entry_path(key);
        Ok(fs::remove_file(path).is_ok())
    }

    async fn clear(&self) -> Result<(), EngineError> {
        let _guard = self.dir_lock.lock().await;
        for path in self.entry_files()? {
            let _ = fs::remove_file(path);
        }
        self.counters.reset();
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize, EngineError> {
        let _guard = self.dir_lock.lock().await;
        let mut removed = 0;
        for path in self.entry_files()? {
            match self.read_entry(&path) {
                Some(entry) if entry.is_expired() => {
                    let _ = fs::remove_file(&path);
                    self.counters.expired_removal();
                    removed += 1;
                }
                Some(_) => {}
                // read_entry already dropped the corrupt file.
                None => removed += 1,
            }
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats, EngineError> {
        let size = self.entry_files()?.len();
        Ok(self.counters.snapshot(self.backend(), size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn round_trip_and_stats() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf(), None).unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
        cache.put("k", &json!({"v": 1}), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().unwrap().value, json!({"v": 1}));
        let stats = cache.stats().await.unwrap();
        assert_eq!((stats.hits, stats.misses, stats.puts, stats.size), (1, 1, 1, 1));
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = FileCache::new(dir.path().to_path_buf(), None).unwrap();
            cache.put("k", &json!("persisted"), None).await.unwrap();
        }
        let reopened = FileCache::new(dir.path().to_path_buf(), None).unwrap();
        assert_eq!(
            reopened.get("k").await.unwrap().unwrap().value,
            json!("persisted")
        );
    }

    #[tokio::test]
    async fn corrupt_entries_become_misses() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf(), None).unwrap();
        cache.put("k", &json!(1), None).await.unwrap();
        fs::write(cache.entry_path("k"), b"not json").unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
        assert_eq!(cache.stats().await.unwrap().errors, 1);
    }

    #[tokio::test]
    async fn cleanup_scans_the_directory() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf(), None).unwrap();
        cache.put("live", &json!(1), None).await.unwrap();
        cache.put("dead", &json!(2), Some(60)).await.unwrap();
        let dead_path = cache.entry_path("dead");
        let mut entry: CacheEntry =
            serde_json::from_slice(&fs::read(&dead_path).unwrap()).unwrap();
        entry.expires_at = Some(Utc::now() - ChronoDuration::seconds(5));
        fs::write(&dead_path, serde_json::to_vec(&entry).unwrap()).unwrap();
        assert_eq!(cache.cleanup_expired().await.unwrap(), 1);
        assert_eq!(cache.stats().await.unwrap().size, 1);
        assert!(cache.get("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalidate_and_clear() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf(), None).unwrap();
        cache.put("a", &json!(1), None).await.unwrap();
        cache.put("b", &json!(2), None).await.unwrap();
        assert!(cache.invalidate("a").await.unwrap());
        assert!(!cache.invalidate("a").await.unwrap());
        cache.clear().await.unwrap();
        assert_eq!(cache.stats().await.unwrap().size, 0);
    }
}

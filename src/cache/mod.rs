//! Per-task result caching.
//!
//! A cache maps a fingerprint of a task's effective inputs to its output.
//! Backends differ in durability (memory, file, Redis) but share one
//! contract; backend failures never fail a task: reads degrade to misses
//! and write failures are logged.

mod file;
mod memory;
mod redis;

pub use file::FileCache;
pub use memory::MemoryCache;
pub use redis::RedisCache;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::EngineError;

/// A stored task output with its lifetime metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(value: Value, ttl_seconds: Option<u64>) -> Self {
        let created_at = Utc::now();
        CacheEntry {
            value,
            created_at,
            expires_at: ttl_seconds
                .map(|secs| created_at + ChronoDuration::seconds(secs as i64)),
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() > expires_at,
            None => false,
        }
    }
}

/// Counters reported by [`Cache::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub backend: String,
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub expired_removals: u64,
    pub errors: u64,
}

/// Shared hit/miss accounting used by every backend.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
    expired_removals: AtomicU64,
    errors: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn expired_removal(&self) {
        self.expired_removals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.puts.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.expired_removals.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, backend: &str, size: usize) -> CacheStats {
        CacheStats {
            backend: backend.to_string(),
            size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_removals: self.expired_removals.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Storage contract shared by all cache backends. Implementations are
/// thread-safe; expiry is enforced on read even where the backend also
/// expires server-side.
#[async_trait]
pub trait Cache: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, EngineError>;

    async fn put(
        &self,
        key: &str,
        value: &Value,
        ttl_seconds: Option<u64>,
    ) -> Result<(), EngineError>;

    /// Remove one entry. Returns whether it existed.
    async fn invalidate(&self, key: &str) -> Result<bool, EngineError>;

    async fn clear(&self) -> Result<(), EngineError>;

    /// Remove expired entries, returning how many were dropped.
    async fn cleanup_expired(&self) -> Result<usize, EngineError>;

    async fn stats(&self) -> Result<CacheStats, EngineError>;
}

/// Declarative backend selection, as it appears in workflow templates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheConfig {
    Memory {
        #[serde(default = "default_max_size")]
        max_size: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_ttl: Option<u64>,
    },
    File {
        cache_dir: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_ttl: Option<u64>,
    },
    Redis {
        #[serde(default = "default_redis_host")]
        host: String,
        #[serde(default = "default_redis_port")]
        port: u16,
        #[serde(default)]
        db: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_ttl: Option<u64>,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
        #[serde(default = "default_max_connections")]
        max_connections: usize,
    },
}

fn default_max_size() -> usize {
    1000
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "weft:".to_string()
}

fn default_max_connections() -> usize {
    10
}

/// Build a backend from its declarative description.
pub fn from_config(config: &CacheConfig) -> Result<Arc<dyn Cache>, EngineError> {
    Ok(match config {
        CacheConfig::Memory {
            max_size,
            default_ttl,
        } => Arc::new(MemoryCache::new(*max_size, *default_ttl)),
        CacheConfig::File {
            cache_dir,
            default_ttl,
        } => Arc::new(FileCache::new(cache_dir.clone(), *default_ttl)?),
        CacheConfig::Redis {
            host,
            port,
            db,
            password,
            default_ttl,
            key_prefix,
            max_connections,
        } => Arc::new(RedisCache::new(
            host,
            *port,
            *db,
            password.as_deref(),
            *default_ttl,
            key_prefix.clone(),
            *max_connections,
        )?),
    })
}

/// Compute the cache key for a task execution.
///
/// The key covers the task type, the canonical form of the resolved config,
/// and the fingerprints of the upstream outputs the config referenced,
/// sorted and without instance ids, so identical effective inputs collide on
/// the same line regardless of graph shape. `version` is an optional salt.
pub fn fingerprint(
    task_type: &str,
    config: &Value,
    upstream_outputs: &BTreeMap<String, Value>,
    version: Option<&str>,
) -> String {
    let mut upstream: Vec<String> = upstream_outputs
        .values()
        .map(|output| sha256_hex(canonical_json(output).as_bytes()))
        .collect();
    upstream.sort_unstable();

    let mut material = serde_json::Map::new();
    material.insert("type".to_string(), Value::String(task_type.to_string()));
    material.insert("config".to_string(), config.clone());
    material.insert(
        "upstream".to_string(),
        Value::Array(upstream.into_iter().map(Value::String).collect()),
    );
    if let Some(version) = version {
        material.insert("version".to_string(), Value::String(version.to_string()));
    }
    sha256_hex(canonical_json(&Value::Object(material)).as_bytes())
}

/// Deterministic JSON rendering: map keys emitted in sorted order at every
/// level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// SHA-256 digest encoded as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Per-fingerprint in-flight locks: at most one computation per key within a
/// run; concurrent holders of the same fingerprint queue and re-check the
/// cache after the first completes.
#[derive(Debug, Default)]
pub(crate) struct InflightIndex {
    locks: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InflightIndex {
    pub(crate) fn lease(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": [1, {"y": 2, "x": 3}], "w": null}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"w":null,"z":[1,{"x":3,"y":2}]},"b":1}"#
        );
    }

    #[test]
    fn fingerprint_ignores_graph_shape() {
        let config = json!({"input": [10, 20, 30]});
        let mut from_a = BTreeMap::new();
        from_a.insert("a".to_string(), json!({"numbers": [10, 20, 30]}));
        let mut from_b = BTreeMap::new();
        from_b.insert("b".to_string(), json!({"numbers": [10, 20, 30]}));
        assert_eq!(
            fingerprint("stats", &config, &from_a, None),
            fingerprint("stats", &config, &from_b, None)
        );
    }

    #[test]
    fn fingerprint_varies_with_inputs_and_version() {
        let empty = BTreeMap::new();
        let base = fingerprint("stats", &json!({"n": 1}), &empty, None);
        assert_ne!(base, fingerprint("stats", &json!({"n": 2}), &empty, None));
        assert_ne!(base, fingerprint("other", &json!({"n": 1}), &empty, None));
        assert_ne!(base, fingerprint("stats", &json!({"n": 1}), &empty, Some("v2")));
    }

    #[test]
    fn entry_expiry() {
        let fresh = CacheEntry::new(json!(1), Some(3600));
        assert!(!fresh.is_expired());
        let mut stale = CacheEntry::new(json!(1), Some(1));
        stale.expires_at = Some(Utc::now() - ChronoDuration::seconds(1));
        assert!(stale.is_expired());
        let eternal = CacheEntry::new(json!(1), None);
        assert!(!eternal.is_expired());
    }
}

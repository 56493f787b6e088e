//! Redis-backed cache for sharing entries across processes.
//!
//! Values are opaque canonical-JSON blobs under `<key_prefix><fingerprint>`
//! keys with server-side TTL. Connections are multiplexed and pooled, capped
//! at `max_connections`. Coordination across processes is best-effort: two
//! processes may compute the same value and the last `put` wins.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::cache::{Cache, CacheCounters, CacheEntry, CacheStats};
use crate::error::{EngineError, ErrorKind};

pub struct RedisCache {
    client: redis::Client,
    key_prefix: String,
    default_ttl: Option<u64>,
    idle: Mutex<Vec<MultiplexedConnection>>,
    permits: Arc<Semaphore>,
    counters: CacheCounters,
}

impl RedisCache {
    pub fn new(
        host: &str,
        port: u16,
        db: i64,
        password: Option<&str>,
        default_ttl: Option<u64>,
        key_prefix: String,
        max_connections: usize,
    ) -> Result<Self, EngineError> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_string(), port),
            redis: redis::RedisConnectionInfo {
                db,
                password: password.map(str::to_string),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info).map_err(|err| {
            EngineError::with_source(
                ErrorKind::CacheBackend,
                format!("invalid redis connection settings: {}", err),
                Box::new(err),
            )
        })?;
        Ok(RedisCache {
            client,
            key_prefix,
            default_ttl,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            counters: CacheCounters::default(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn acquire(
        &self,
    ) -> Result<(OwnedSemaphorePermit, MultiplexedConnection), EngineError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::new(ErrorKind::CacheBackend, "redis pool closed"))?;
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok((permit, conn));
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| self.backend_error("failed to connect to redis", err))?;
        Ok((permit, conn))
    }

    /// Return a healthy connection to the pool. Connections that saw an
    /// error are dropped instead so the next caller reconnects.
    async fn recycle(&self, conn: MultiplexedConnection) {
        self.idle.lock().await.push(conn);
    }

    fn backend_error(&self, message: &str, err: redis::RedisError) -> EngineError {
        self.counters.error();
        EngineError::with_source(
            ErrorKind::CacheBackend,
            format!("{}: {}", message, err),
            Box::new(err),
        )
    }

    async fn prefixed_keys(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<Vec<String>, EngineError> {
        let pattern = format!("{}*", self.key_prefix);
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<'_, String> = conn
            .scan_match(pattern)
            .await
            .map_err(|err| self.backend_error("redis scan failed", err))?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

#[async_trait]
impl Cache for RedisCache {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, EngineError> {
        let (permit, mut conn) = self.acquire().await?;
        let full_key = self.full_key(key);
        let blob: Option<Vec<u8>> = match conn.get(&full_key).await {
            Ok(blob) => blob,
            Err(err) => return Err(self.backend_error("redis get failed", err)),
        };
        let Some(blob) = blob else {
            self.recycle(conn).await;
            drop(permit);
            self.counters.miss();
            return Ok(None);
        };
        let entry: CacheEntry = match serde_json::from_slice(&blob) {
            Ok(entry) => entry,
            Err(_) => {
                // Unreadable blob: drop it and report a miss.
                let _: Result<i64, _> = conn.del(&full_key).await;
                self.recycle(conn).await;
                drop(permit);
                self.counters.error();
                self.counters.miss();
                return Ok(None);
            }
        };
        // The server enforces TTL; this guards against clock skew.
        if entry.is_expired() {
            let _: Result<i64, _> = conn.del(&full_key).await;
            self.recycle(conn).await;
            drop(permit);
            self.counters.expired_removal();
            self.counters.miss();
            return Ok(None);
        }
        self.recycle(conn).await;
        drop(permit);
        self.counters.hit();
        Ok(Some(entry))
    }

    async fn put(
        &self,
        key: &str,
        value: &Value,
        ttl_seconds: Option<u64>,
    ) -> Result<(), EngineError> {
        let ttl = ttl_seconds.or(self.default_ttl);
        let entry = CacheEntry::new(value.clone(), ttl);
        let blob = serde_json::to_vec(&entry).map_err(|err| {
            self.counters.error();
            EngineError::with_source(
                ErrorKind::CacheBackend,
                format!("failed to serialize cache entry: {}", err),
                Box::new(err),
            )
        })?;
        let (permit, mut conn) = self.acquire().await?;
        let full_key = self.full_key(key);
        let outcome = match ttl {
            Some(secs) => conn.set_ex::<_, _, ()>(&full_key, blob, secs).await,
            None => conn.set::<_, _, ()>(&full_key, blob).await,
        };
        if let Err(err) = outcome {
            return Err(self.backend_error("redis set failed", err));
        }
        self.recycle(conn).await;
        drop(permit);
        self.counters.put();
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<bool, EngineError> {
        let (permit, mut conn) = self.acquire().await?;
        let removed: i64 = conn
            .del(self.full_key(key))
            .await
            .map_err(|err| self.backend_error("redis del failed", err))?;
        self.recycle(conn).await;
        drop(permit);
        Ok(removed > 0)
    }

    async fn clear(&self) -> Result<(), EngineError> {
        let (permit, mut conn) = self.acquire().await?;
        let keys = self.prefixed_keys(&mut conn).await?;
        if !keys.is_empty() {
            let _: i64 = conn
                .del(keys)
                .await
                .map_err(|err| self.backend_error("redis del failed", err))?;
        }
        self.recycle(conn).await;
        drop(permit);
        self.counters.reset();
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize, EngineError> {
        let (permit, mut conn) = self.acquire().await?;
        let keys = self.prefixed_keys(&mut conn).await?;
        let mut removed = 0;
        for key in keys {
            let blob: Option<Vec<u8>> = conn
                .get(&key)
                .await
                .map_err(|err| self.backend_error("redis get failed", err))?;
            let Some(blob) = blob else { continue };
            let expired = match serde_json::from_slice::<CacheEntry>(&blob) {
                Ok(entry) => entry.is_expired(),
                // Unreadable blob: treat as garbage and remove it.
                Err(_) => true,
            };
            if expired {
                let _: i64 = conn
                    .del(&key)
                    .await
                    .map_err(|err| self.backend_error("redis del failed", err))?;
                self.counters.expired_removal();
                removed += 1;
            }
        }
        self.recycle(conn).await;
        drop(permit);
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats, EngineError> {
        let (permit, mut conn) = self.acquire().await?;
        let size = self.prefixed_keys(&mut conn).await?.len();
        self.recycle(conn).await;
        drop(permit);
        Ok(self.counters.snapshot(self.backend(), size))
    }
}

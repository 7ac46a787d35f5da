//! Response cache
//!
//! TTL-based key-value layer in front of the upstream client. The cache is
//! a client of a backing store (Redis in production, an in-memory map in
//! local-only mode), not its own persistence engine. `get_or_fetch` adds
//! the single-flight guarantee: concurrent callers missing on the same key
//! share one upstream fetch and its outcome.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;

/// Backing key-value store: `get`, `set` with TTL, `delete`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Redis-backed store using a multiplexed connection shared by all tasks.
pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        // SETEX takes whole seconds; never round a positive TTL down to zero.
        let secs = ttl.as_secs().max(1);
        redis::cmd("SETEX")
            .arg(key)
            .arg(secs)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
    last_used: Instant,
}

/// In-memory store for local-only mode and tests.
///
/// Entries expire lazily on read; no background sweep. Storage is bounded
/// by `max_entries` with least-recently-used eviction on insert.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    max_entries: usize,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>>> {
        self.entries
            .lock()
            .map_err(|_| GatewayError::Cache("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.lock()?;
        let now = Instant::now();

        match entries.get_mut(key) {
            Some(entry) if now < entry.expires_at => {
                entry.last_used = now;
                Ok(Some(entry.value.clone()))
            }
            Some(_) => {
                // A live entry is never returned past its expiry.
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.lock()?;
        let now = Instant::now();

        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            let evict = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| k.clone());
            if let Some(k) = evict {
                entries.remove(&k);
            }
        }

        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: now + ttl,
                last_used: now,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

type Flight = Arc<OnceCell<std::result::Result<String, GatewayError>>>;

/// TTL cache with the single-flight guarantee.
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    flights: DashMap<String, Flight>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            flights: DashMap::new(),
        }
    }

    /// Return the cached value for `key`, or invoke `fetch` exactly once to
    /// produce it and store it with `expires_at = now + ttl`.
    ///
    /// Concurrent callers that miss on the same key wait on the first
    /// caller's fetch and receive the same value or the same error; the
    /// error is not retried per waiter.
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(raw) = self.read_store(key).await {
            match serde_json::from_str(&raw) {
                Ok(value) => {
                    tracing::debug!(key, "cache hit");
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "cached value failed to deserialize, refetching");
                    let _ = self.store.delete(key).await;
                }
            }
        }

        // The guard from `entry` must not be held across an await; clone the
        // flight out first.
        let flight: Flight = self.flights.entry(key.to_string()).or_default().clone();

        let outcome = flight
            .get_or_init(|| async {
                tracing::debug!(key, "cache miss, fetching upstream");
                match fetch().await {
                    Ok(value) => match serde_json::to_string(&value) {
                        Ok(raw) => {
                            if let Err(e) = self.store.set(key, &raw, ttl).await {
                                tracing::warn!(key, error = %e, "failed to write cache entry");
                            }
                            Ok(raw)
                        }
                        Err(e) => Err(GatewayError::Cache(format!(
                            "failed to serialize cache value: {e}"
                        ))),
                    },
                    Err(e) => Err(e),
                }
            })
            .await
            .clone();

        // A landed flight must not satisfy later misses; errors in
        // particular would otherwise stick forever.
        self.flights
            .remove_if(key, |_, cell| Arc::ptr_eq(cell, &flight));

        let raw = outcome?;
        serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Cache(format!("failed to deserialize cache value: {e}")))
    }

    /// Drop the entry for `key`, if any.
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.store.delete(key).await
    }

    /// A store read failure degrades to a miss rather than failing the
    /// request; the gateway keeps serving without its cache.
    async fn read_store(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache store read failed, treating as miss");
                None
            }
        }
    }
}

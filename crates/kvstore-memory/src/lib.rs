#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kvstore-memory** – In-memory storage driver for the kvstore
//! persistence kernel.
//!
//! A concurrent hash map from key to cache entry, with optional TTL
//! expiry and size-bounded LRU eviction. Point lookups are O(1)
//! amortized; `get_all` and LRU eviction scan the map, which is the
//! right trade-off for the cache sizes this backend is meant for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use kvstore_core::{Entity, Predicate, Store, StoreResult};

/// Tunables for [`MemoryBackend`].
#[derive(Clone, Debug)]
pub struct MemoryConfig {
    /// Expiry applied to entries that don't set their own explicit expiry.
    /// `None` disables the default TTL.
    pub default_ttl: Option<Duration>,
    /// Maximum number of live entries. `0` means unbounded.
    pub max_cache_size: usize,
    /// Whether the background TTL sweep runs at all.
    pub enable_eviction: bool,
    /// Interval between background TTL sweeps.
    pub eviction_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_ttl: None,
            max_cache_size: 0,
            enable_eviction: true,
            eviction_interval: Duration::from_secs(60),
        }
    }
}

struct CacheEntry<T> {
    value: T,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    /// Insertion order, used only to break last_accessed ties in LRU
    /// eviction deterministically.
    seq: u64,
    explicit_expiry: Option<DateTime<Utc>>,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: DateTime<Utc>, default_ttl: Option<Duration>) -> bool {
        if let Some(expiry) = self.explicit_expiry {
            if expiry <= now {
                return true;
            }
        }
        if let Some(ttl) = default_ttl {
            if let Ok(ttl) = chrono::Duration::from_std(ttl) {
                return now - self.created_at > ttl;
            }
        }
        false
    }
}

struct Inner<T> {
    map: RwLock<HashMap<String, CacheEntry<T>>>,
    config: MemoryConfig,
    seq: AtomicU64,
    eviction_task: RwLock<Option<JoinHandle<()>>>,
}

/// An in-memory, non-persistent storage backend with TTL and LRU eviction.
///
/// All data is lost when the last handle to the backend is dropped.
pub struct MemoryBackend<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for MemoryBackend<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> MemoryBackend<T> {
    /// Create a backend with default tunables (no TTL, unbounded, eviction
    /// sweep every 60s but with nothing to evict).
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Create a backend with explicit tunables, starting the background
    /// eviction ticker if `config.enable_eviction` is set.
    pub fn with_config(config: MemoryConfig) -> Self {
        let inner = Arc::new(Inner {
            map: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            eviction_task: RwLock::new(None),
            config,
        });

        if inner.config.enable_eviction {
            let weak = Arc::downgrade(&inner);
            let interval = inner.config.eviction_interval;
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let now = Utc::now();
                    let default_ttl = inner.config.default_ttl;
                    let mut map = inner.map.write().await;
                    map.retain(|_, entry| !entry.is_expired(now, default_ttl));
                }
            });
            // Safe to assign synchronously: nothing else has a handle yet.
            if let Ok(mut slot) = inner.eviction_task.try_write() {
                *slot = Some(handle);
            }
        }

        Self { inner }
    }

    /// Current number of live (non-expired) entries.
    pub async fn len(&self) -> usize {
        let now = Utc::now();
        let default_ttl = self.inner.config.default_ttl;
        self.inner
            .map
            .read()
            .await
            .values()
            .filter(|e| !e.is_expired(now, default_ttl))
            .count()
    }

    /// `true` if the backend currently holds no live entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Overwrite an entry's explicit expiry, independent of `default_ttl`.
    pub async fn set_expiry(&self, key: &str, expiry: Option<DateTime<Utc>>) {
        if let Some(entry) = self.inner.map.write().await.get_mut(key) {
            entry.explicit_expiry = expiry;
        }
    }

    async fn evict_one_if_full(&self, map: &mut HashMap<String, CacheEntry<T>>) {
        let limit = self.inner.config.max_cache_size;
        if limit == 0 || map.len() < limit {
            return;
        }
        if let Some(victim) = map
            .iter()
            .min_by_key(|(_, e)| (e.last_accessed, e.seq))
            .map(|(k, _)| k.clone())
        {
            map.remove(&victim);
        }
    }
}

impl<T: Entity> Default for MemoryBackend<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Entity> Store<T> for MemoryBackend<T> {
    async fn get(&self, key: &str) -> StoreResult<Option<T>> {
        let now = Utc::now();
        let default_ttl = self.inner.config.default_ttl;
        let mut map = self.inner.map.write().await;
        let Some(entry) = map.get(key) else {
            return Ok(None);
        };
        if entry.is_expired(now, default_ttl) {
            map.remove(key);
            return Ok(None);
        }
        let value = entry.value.clone();
        if let Some(entry) = map.get_mut(key) {
            entry.last_accessed = now;
        }
        Ok(Some(value))
    }

    async fn get_all(&self, predicate: Option<&Predicate<T>>) -> StoreResult<Vec<T>> {
        let now = Utc::now();
        let default_ttl = self.inner.config.default_ttl;
        let map = self.inner.map.read().await;
        Ok(map
            .values()
            .filter(|e| !e.is_expired(now, default_ttl))
            .map(|e| e.value.clone())
            .filter(|v| predicate.map(|p| p.matches(v)).unwrap_or(true))
            .collect())
    }

    async fn save(&self, key: &str, entity: T) -> StoreResult<()> {
        let now = Utc::now();
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let mut map = self.inner.map.write().await;
        let created_at = map.get(key).map(|e| e.created_at).unwrap_or(now);
        if !map.contains_key(key) {
            self.evict_one_if_full(&mut map).await;
        }
        map.insert(
            key.to_string(),
            CacheEntry {
                value: entity,
                created_at,
                last_accessed: now,
                seq,
                explicit_expiry: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.map.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn clear(&self) -> StoreResult<usize> {
        let mut map = self.inner.map.write().await;
        let count = map.len();
        map.clear();
        Ok(count)
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.eviction_task.try_write() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

//! Process-local caches of placement metadata
//!
//! Caches are pull-based: a key is loaded from the Metadata Store on first
//! access and then served from memory until an explicit flush. There is no
//! push invalidation; a snapshot may lag the store until flushed.
//!
//! Each key has its own async mutex so a load and a flush of the same key
//! never interleave. Snapshots are immutable and shared as `Arc`s, so a
//! reader holding one never sees it change underneath.

pub mod database;
pub mod routing;

pub use database::{DatabaseCache, DatabaseLoader};
pub use routing::{RoutingCache, RoutingLoader};

use crate::common::{CacheConfig, Error, MetricsRegistry, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Cached view of one key as observed at `store_version`.
#[derive(Debug)]
pub struct CacheSnapshot<V> {
    /// Version of the entry itself; 0 when absent
    pub version: u64,
    /// Catalog version the snapshot was read at
    pub store_version: u64,
    /// `None` when the store had no metadata for the key
    pub data: Option<V>,
    pub loaded_at: Instant,
}

impl<V> CacheSnapshot<V> {
    pub fn new(store_version: u64, data: Option<V>, version_of: impl Fn(&V) -> u64) -> Self {
        Self {
            version: data.as_ref().map(version_of).unwrap_or(0),
            store_version,
            data,
            loaded_at: Instant::now(),
        }
    }

    pub fn is_absent(&self) -> bool {
        self.data.is_none()
    }
}

/// Source of truth behind a cache.
#[async_trait]
pub trait CacheLoader: Send + Sync + 'static {
    type Value: Send + Sync + 'static;

    /// Short name used in logs
    fn kind(&self) -> &'static str;

    async fn load(&self, key: &str) -> Result<CacheSnapshot<Self::Value>>;
}

type Slot<V> = Arc<tokio::sync::Mutex<Option<Arc<CacheSnapshot<V>>>>>;

/// Generic explicitly-invalidated cache.
pub struct CatalogCache<L: CacheLoader> {
    loader: L,
    slots: Mutex<HashMap<String, Slot<L::Value>>>,
    config: CacheConfig,
    metrics: Arc<MetricsRegistry>,
}

impl<L: CacheLoader> CatalogCache<L> {
    pub fn new(loader: L, config: CacheConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            loader,
            slots: Mutex::new(HashMap::new()),
            config,
            metrics,
        }
    }

    fn slot(&self, key: &str) -> Slot<L::Value> {
        self.slots
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Current snapshot for `key`, loading it if missing or flushed.
    pub async fn get(&self, key: &str) -> Result<Arc<CacheSnapshot<L::Value>>> {
        let slot = self.slot(key);
        let mut cached = slot.lock().await;
        if let Some(snapshot) = cached.as_ref() {
            self.metrics.cache_hits.inc();
            return Ok(snapshot.clone());
        }
        self.metrics.cache_misses.inc();
        let snapshot = Arc::new(self.loader.load(key).await?);
        debug!(
            cache = self.loader.kind(),
            key,
            version = snapshot.version,
            store_version = snapshot.store_version,
            absent = snapshot.is_absent(),
            "loaded cache entry"
        );
        *cached = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Drop the local snapshot for `key`. Always succeeds, including for
    /// keys never loaded; the store is not touched.
    pub async fn flush(&self, key: &str) {
        let Some(slot) = self.slots.lock().get(key).cloned() else {
            debug!(cache = self.loader.kind(), key, "flush of unknown key");
            return;
        };
        let mut cached = slot.lock().await;
        let had = cached.take().is_some();
        debug!(cache = self.loader.kind(), key, had, "flushed cache entry");
    }

    /// Snapshot whose entry version is at least `version`. A stale snapshot
    /// is flushed and reloaded with backoff; once attempts run out the
    /// freshest snapshot seen is returned.
    pub async fn get_at_least(
        &self,
        key: &str,
        version: u64,
    ) -> Result<Arc<CacheSnapshot<L::Value>>> {
        let mut delay = self.config.stale_retry_delay();
        let mut snapshot = self.get(key).await?;
        for _ in 0..self.config.stale_retry_attempts {
            if snapshot.version >= version {
                return Ok(snapshot);
            }
            let stale = Error::StaleRead {
                key: key.to_string(),
                have: snapshot.version,
                need: version,
            };
            debug!(cache = self.loader.kind(), error = %stale, "reloading stale entry");
            self.metrics.cache_stale_reloads.inc();
            self.flush(key).await;
            snapshot = self.get(key).await?;
            if snapshot.version >= version {
                return Ok(snapshot);
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        if snapshot.version < version {
            warn!(
                cache = self.loader.kind(),
                key,
                have = snapshot.version,
                need = version,
                "entry still behind after reloads"
            );
        }
        Ok(snapshot)
    }

    /// Keys with a loaded snapshot.
    pub fn cached_keys(&self) -> Vec<String> {
        let slots: Vec<(String, Slot<L::Value>)> = self
            .slots
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        slots
            .into_iter()
            .filter(|(_, slot)| matches!(slot.try_lock(), Ok(guard) if guard.is_some()))
            .map(|(k, _)| k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Serves `version` for every key except "missing"; each load bumps it.
    struct CountingLoader {
        loads: AtomicU64,
    }

    #[async_trait]
    impl CacheLoader for CountingLoader {
        type Value = u64;

        fn kind(&self) -> &'static str {
            "counting"
        }

        async fn load(&self, key: &str) -> Result<CacheSnapshot<u64>> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
            let data = (key != "missing").then_some(n);
            Ok(CacheSnapshot::new(n, data, |v| *v))
        }
    }

    fn cache() -> CatalogCache<CountingLoader> {
        CatalogCache::new(
            CountingLoader {
                loads: AtomicU64::new(0),
            },
            CacheConfig {
                stale_retry_attempts: 3,
                stale_retry_delay_ms: 1,
            },
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_serves_cached_until_flush() {
        let cache = cache();
        assert_eq!(cache.get("a").await.unwrap().version, 1);
        assert_eq!(cache.get("a").await.unwrap().version, 1);
        cache.flush("a").await;
        assert_eq!(cache.get("a").await.unwrap().version, 2);
        assert_eq!(cache.metrics.cache_hits.get(), 1);
        assert_eq!(cache.metrics.cache_misses.get(), 2);
    }

    #[tokio::test]
    async fn test_absent_entries_are_cached() {
        let cache = cache();
        let snap = cache.get("missing").await.unwrap();
        assert!(snap.is_absent());
        assert_eq!(snap.version, 0);
        cache.get("missing").await.unwrap();
        assert_eq!(cache.loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flush_unknown_key_is_noop() {
        let cache = cache();
        cache.flush("never.seen").await;
        assert_eq!(cache.loader.loads.load(Ordering::SeqCst), 0);
        assert!(cache.cached_keys().is_empty());
    }

    #[tokio::test]
    async fn test_flushing_unknown_keys_allocates_nothing() {
        let cache = cache();
        for i in 0..1000 {
            cache.flush(&format!("db{}.coll", i)).await;
        }
        assert!(cache.slots.lock().is_empty());

        cache.get("a").await.unwrap();
        cache.flush("a").await;
        assert_eq!(cache.slots.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_get_at_least_reloads_stale() {
        let cache = cache();
        cache.get("a").await.unwrap();
        let snap = cache.get_at_least("a", 3).await.unwrap();
        assert!(snap.version >= 3);
        assert!(cache.metrics.cache_stale_reloads.get() >= 2);
    }

    #[tokio::test]
    async fn test_get_at_least_never_fails_on_staleness() {
        let cache = cache();
        let snap = cache.get_at_least("missing", 10).await.unwrap();
        assert!(snap.is_absent());
    }

    #[tokio::test]
    async fn test_concurrent_get_and_flush() {
        let cache = Arc::new(cache());
        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    cache.flush("k").await;
                    None
                } else {
                    Some(cache.get("k").await.unwrap())
                }
            }));
        }
        for handle in handles {
            if let Some(snap) = handle.await.unwrap() {
                assert_eq!(snap.data, Some(snap.version));
            }
        }
    }
}

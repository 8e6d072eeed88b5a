//! Routing table cache: namespace -> chunk placement

use crate::cache::{CacheLoader, CacheSnapshot, CatalogCache};
use crate::catalog::NamespaceRoute;
use crate::common::{CacheConfig, MetricsRegistry, Result};
use crate::replication::MetadataClient;
use async_trait::async_trait;
use std::sync::Arc;

pub struct RoutingLoader {
    client: MetadataClient,
}

impl RoutingLoader {
    pub fn new(client: MetadataClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CacheLoader for RoutingLoader {
    type Value = NamespaceRoute;

    fn kind(&self) -> &'static str {
        "routing"
    }

    async fn load(&self, namespace: &str) -> Result<CacheSnapshot<NamespaceRoute>> {
        let catalog = self.client.read().await?;
        Ok(CacheSnapshot::new(
            catalog.version,
            catalog.route(namespace).cloned(),
            |route| route.placement_version,
        ))
    }
}

pub struct RoutingCache {
    cache: CatalogCache<RoutingLoader>,
    metrics: Arc<MetricsRegistry>,
}

impl RoutingCache {
    pub fn new(client: MetadataClient, config: CacheConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            cache: CatalogCache::new(RoutingLoader::new(client), config, metrics.clone()),
            metrics,
        }
    }

    pub async fn get(&self, namespace: &str) -> Result<Arc<CacheSnapshot<NamespaceRoute>>> {
        self.cache.get(namespace).await
    }

    /// Route with placement version at least `version`.
    pub async fn get_at_least(
        &self,
        namespace: &str,
        version: u64,
    ) -> Result<Arc<CacheSnapshot<NamespaceRoute>>> {
        self.cache.get_at_least(namespace, version).await
    }

    /// `_flushRoutingTableCacheUpdates`: succeeds for any namespace.
    pub async fn flush(&self, namespace: &str) {
        self.metrics.routing_flushes.inc();
        self.cache.flush(namespace).await;
    }

    /// Shard owning `key` in `namespace`, `None` when the namespace is
    /// not routed.
    pub async fn owning_shard(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let snapshot = self.get(namespace).await?;
        Ok(snapshot
            .data
            .as_ref()
            .and_then(|route| route.find_intersecting_chunk(key))
            .map(|chunk| chunk.shard_id.clone()))
    }

    pub fn cached_namespaces(&self) -> Vec<String> {
        self.cache.cached_keys()
    }
}

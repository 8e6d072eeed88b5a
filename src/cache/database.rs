//! Database cache: database name -> primary shard

use crate::cache::{CacheLoader, CacheSnapshot, CatalogCache};
use crate::catalog::DatabaseEntry;
use crate::common::{CacheConfig, MetricsRegistry, Result};
use crate::replication::MetadataClient;
use async_trait::async_trait;
use std::sync::Arc;

pub struct DatabaseLoader {
    client: MetadataClient,
}

impl DatabaseLoader {
    pub fn new(client: MetadataClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CacheLoader for DatabaseLoader {
    type Value = DatabaseEntry;

    fn kind(&self) -> &'static str {
        "database"
    }

    async fn load(&self, db_name: &str) -> Result<CacheSnapshot<DatabaseEntry>> {
        let catalog = self.client.read().await?;
        Ok(CacheSnapshot::new(
            catalog.version,
            catalog.database(db_name).cloned(),
            |db| db.version,
        ))
    }
}

pub struct DatabaseCache {
    cache: CatalogCache<DatabaseLoader>,
    metrics: Arc<MetricsRegistry>,
}

impl DatabaseCache {
    pub fn new(client: MetadataClient, config: CacheConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            cache: CatalogCache::new(DatabaseLoader::new(client), config, metrics.clone()),
            metrics,
        }
    }

    pub async fn get(&self, db_name: &str) -> Result<Arc<CacheSnapshot<DatabaseEntry>>> {
        self.cache.get(db_name).await
    }

    pub async fn get_at_least(
        &self,
        db_name: &str,
        version: u64,
    ) -> Result<Arc<CacheSnapshot<DatabaseEntry>>> {
        self.cache.get_at_least(db_name, version).await
    }

    /// `_flushDatabaseCacheUpdates`: succeeds for any database name.
    pub async fn flush(&self, db_name: &str) {
        self.metrics.database_flushes.inc();
        self.cache.flush(db_name).await;
    }

    pub async fn primary_shard(&self, db_name: &str) -> Result<Option<String>> {
        let snapshot = self.get(db_name).await?;
        Ok(snapshot.data.as_ref().map(|db| db.primary_shard.clone()))
    }

    pub fn cached_databases(&self) -> Vec<String> {
        self.cache.cached_keys()
    }
}

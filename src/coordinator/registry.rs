//! Shard registry and catalog operations over the Metadata Store
//!
//! Every operation validates against a majority-confirmed read, appends one
//! mutation and reads the result back. Deduplication happens when the
//! mutation is applied, so concurrent callers racing on the same target
//! all observe the single entry the log ordered first.

use crate::catalog::{
    database_of, CatalogState, ConnectionTarget, DatabaseEntry, Mutation, NamespaceRoute,
    ShardEntry, TopologyMode,
};
use crate::common::{Error, MetricsRegistry, Result};
use crate::replication::MetadataClient;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddShardOutcome {
    pub shard_id: String,
    /// False when the target was already registered
    pub created: bool,
}

pub struct ShardRegistry {
    client: MetadataClient,
    /// Normalized connection target of the config replica set itself
    config_target: String,
    metrics: Arc<MetricsRegistry>,
}

impl ShardRegistry {
    pub fn new(
        client: MetadataClient,
        config_target: &str,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            config_target: ConnectionTarget::parse(config_target)?.to_string(),
            metrics,
        })
    }

    pub fn config_target(&self) -> &str {
        &self.config_target
    }

    pub async fn catalog(&self) -> Result<Arc<CatalogState>> {
        self.client.read().await
    }

    /// Register a shard. Registering a target that already exists returns
    /// the existing id without appending anything. Registering the config
    /// replica set itself switches the cluster to catalog-shard mode.
    pub async fn add_shard(&self, connection_target: &str) -> Result<AddShardOutcome> {
        let target = ConnectionTarget::parse(connection_target)?.to_string();
        self.metrics.add_shard_total.inc();

        let catalog = self.client.read().await?;
        if let Some(existing) = catalog.shard_by_target(&target) {
            return Ok(self.duplicate(existing));
        }

        let catalog_shard = target == self.config_target;
        let index = self
            .client
            .append(Mutation::AddShard {
                connection_target: target.clone(),
                catalog_shard,
            })
            .await?;

        let catalog = self.client.read().await?;
        let entry = catalog.shard_by_target(&target).ok_or_else(|| {
            Error::Internal(format!("shard for {} missing after commit at {}", target, index))
        })?;
        if entry.registered_at != index {
            return Ok(self.duplicate(entry));
        }

        self.metrics.shard_count.set(catalog.shards.len() as u64);
        info!(
            shard_id = %entry.shard_id,
            target = %target,
            mode = %catalog.mode,
            index,
            "added shard"
        );
        Ok(AddShardOutcome {
            shard_id: entry.shard_id.clone(),
            created: true,
        })
    }

    fn duplicate(&self, existing: &ShardEntry) -> AddShardOutcome {
        self.metrics.add_shard_duplicates.inc();
        let ignored = Error::DuplicateIgnored {
            shard_id: existing.shard_id.clone(),
            target: existing.connection_target.clone(),
        };
        info!(code = ignored.code(), "{}", ignored);
        AddShardOutcome {
            shard_id: existing.shard_id.clone(),
            created: false,
        }
    }

    pub async fn list_shards(&self) -> Result<Vec<ShardEntry>> {
        Ok(self.client.read().await?.shards.values().cloned().collect())
    }

    pub async fn topology_mode(&self) -> Result<TopologyMode> {
        Ok(self.client.read().await?.mode)
    }

    pub async fn shard_for_target(&self, connection_target: &str) -> Result<Option<ShardEntry>> {
        let target = ConnectionTarget::parse(connection_target)?.to_string();
        Ok(self.client.read().await?.shard_by_target(&target).cloned())
    }

    /// Write a user document directly on the config replica set. An `_id`
    /// is generated when the document has none. Returns the `_id`.
    pub async fn insert_document(
        &self,
        namespace: &str,
        mut document: serde_json::Value,
    ) -> Result<String> {
        if database_of(namespace).is_none() {
            return Err(Error::InvalidArgument(format!("invalid namespace {}", namespace)));
        }
        let fields = document
            .as_object_mut()
            .ok_or_else(|| Error::InvalidArgument("document must be a JSON object".into()))?;
        let id = match fields.get("_id") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                fields.insert("_id".into(), serde_json::Value::String(id.clone()));
                id
            }
        };
        let text = serde_json::to_string(&document)?;

        let catalog = self.client.read().await?;
        if catalog.document(namespace, &id).is_some() {
            return Err(duplicate_key(namespace, &id));
        }

        self.client
            .append(Mutation::InsertDocument {
                namespace: namespace.to_string(),
                id: id.clone(),
                document: text.clone(),
            })
            .await?;

        let catalog = self.client.read().await?;
        match catalog.document(namespace, &id) {
            Some(stored) if stored == text => Ok(id),
            _ => Err(duplicate_key(namespace, &id)),
        }
    }

    pub async fn find_document(
        &self,
        namespace: &str,
        id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let catalog = self.client.read().await?;
        catalog
            .document(namespace, id)
            .map(|text| serde_json::from_str(text).map_err(Error::from))
            .transpose()
    }

    /// Create a database on the least loaded shard; existing databases are
    /// returned unchanged.
    pub async fn create_database(&self, name: &str) -> Result<DatabaseEntry> {
        if name.is_empty() || name.contains('.') {
            return Err(Error::InvalidArgument(format!("invalid database name {:?}", name)));
        }
        let catalog = self.client.read().await?;
        if let Some(db) = catalog.database(name) {
            return Ok(db.clone());
        }
        if catalog.shards.is_empty() {
            return Err(Error::NoShards);
        }
        self.client
            .append(Mutation::CreateDatabase {
                name: name.to_string(),
            })
            .await?;
        let catalog = self.client.read().await?;
        let db = catalog.database(name).cloned().ok_or(Error::NoShards)?;
        info!(db = %name, primary = %db.primary_shard, "created database");
        Ok(db)
    }

    /// Shard a collection with one chunk on its database's primary shard.
    pub async fn shard_collection(&self, namespace: &str) -> Result<NamespaceRoute> {
        if database_of(namespace).is_none() {
            return Err(Error::InvalidArgument(format!("invalid namespace {}", namespace)));
        }
        let catalog = self.client.read().await?;
        if let Some(route) = catalog.route(namespace) {
            return Ok(route.clone());
        }
        if catalog.shards.is_empty() {
            return Err(Error::NoShards);
        }
        self.client
            .append(Mutation::ShardCollection {
                namespace: namespace.to_string(),
            })
            .await?;
        let catalog = self.client.read().await?;
        let route = catalog.route(namespace).cloned().ok_or(Error::NoShards)?;
        info!(namespace = %namespace, version = route.placement_version, "sharded collection");
        Ok(route)
    }

    /// Split the chunk containing `at`.
    pub async fn split_chunk(&self, namespace: &str, at: &str) -> Result<NamespaceRoute> {
        let catalog = self.client.read().await?;
        if catalog.route(namespace).is_none() {
            return Err(Error::NamespaceNotFound(namespace.to_string()));
        }
        self.client
            .append(Mutation::SplitChunk {
                namespace: namespace.to_string(),
                at: at.to_string(),
            })
            .await?;
        let catalog = self.client.read().await?;
        catalog
            .route(namespace)
            .cloned()
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))
    }

    pub async fn move_primary(&self, database: &str, to_shard: &str) -> Result<DatabaseEntry> {
        let catalog = self.client.read().await?;
        if catalog.database(database).is_none() {
            return Err(Error::DatabaseNotFound(database.to_string()));
        }
        if !catalog.shards.contains_key(to_shard) {
            return Err(Error::ShardNotFound(to_shard.to_string()));
        }
        self.client
            .append(Mutation::MovePrimary {
                database: database.to_string(),
                to_shard: to_shard.to_string(),
            })
            .await?;
        let catalog = self.client.read().await?;
        catalog
            .database(database)
            .cloned()
            .ok_or_else(|| Error::DatabaseNotFound(database.to_string()))
    }
}

fn duplicate_key(namespace: &str, id: &str) -> Error {
    Error::InvalidArgument(format!("duplicate key: {} _id {}", namespace, id))
}

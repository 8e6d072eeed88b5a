//! Catalog data model and the deterministic state machine over it
//!
//! Every replica applies the same committed [`Mutation`]s in log order, so
//! shard ids, placement versions and the topology mode are identical on all
//! members without any coordination beyond the log itself.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Namespace holding logical session records.
pub const SESSIONS_NAMESPACE: &str = "config.system.sessions";

/// Shard id reserved for the config replica set acting as a shard.
pub const CATALOG_SHARD_ID: &str = "config";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TopologyMode {
    /// No shard entry refers to the config replica set.
    #[default]
    DedicatedConfig,
    /// The config replica set is registered as a shard.
    CatalogShard,
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyMode::DedicatedConfig => write!(f, "dedicated-config"),
            TopologyMode::CatalogShard => write!(f, "catalog-shard"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardMode {
    Dedicated,
    CatalogShard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub shard_id: String,
    /// Normalized connection target
    pub connection_target: String,
    pub mode: ShardMode,
    /// Log index of the entry that registered the shard
    pub registered_at: u64,
}

/// Chunk boundary; `MinKey < Key(_) < MaxKey`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkBound {
    MinKey,
    Key(String),
    MaxKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Inclusive
    pub min: ChunkBound,
    /// Exclusive
    pub max: ChunkBound,
    pub shard_id: String,
}

impl Chunk {
    pub fn contains(&self, key: &ChunkBound) -> bool {
        &self.min <= key && key < &self.max
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRoute {
    pub namespace: String,
    pub placement_version: u64,
    /// Sorted, contiguous, covering `[MinKey, MaxKey)`
    pub chunks: Vec<Chunk>,
}

impl NamespaceRoute {
    fn single_chunk(namespace: &str, shard_id: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            placement_version: 1,
            chunks: vec![Chunk {
                min: ChunkBound::MinKey,
                max: ChunkBound::MaxKey,
                shard_id: shard_id.to_string(),
            }],
        }
    }

    pub fn find_intersecting_chunk(&self, key: &str) -> Option<&Chunk> {
        let key = ChunkBound::Key(key.to_string());
        self.chunks.iter().find(|c| c.contains(&key))
    }

    /// Split the chunk containing `at`. Returns false when `at` already
    /// starts a chunk.
    fn split_at(&mut self, at: &str) -> bool {
        let bound = ChunkBound::Key(at.to_string());
        let Some(pos) = self.chunks.iter().position(|c| c.contains(&bound)) else {
            return false;
        };
        if self.chunks[pos].min == bound {
            return false;
        }
        let upper = Chunk {
            min: bound.clone(),
            max: self.chunks[pos].max.clone(),
            shard_id: self.chunks[pos].shard_id.clone(),
        };
        self.chunks[pos].max = bound;
        self.chunks.insert(pos + 1, upper);
        self.placement_version += 1;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub db_name: String,
    pub primary_shard: String,
    pub version: u64,
}

/// Split `db.collection` into its database part.
pub fn database_of(namespace: &str) -> Option<&str> {
    match namespace.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Some(db),
        _ => None,
    }
}

/// A topology or catalog change, totally ordered by the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Appended by every new leader to commit an entry in its own term
    Noop,
    AddShard {
        connection_target: String,
        catalog_shard: bool,
    },
    /// Direct write of a user document on the config replica set
    InsertDocument {
        namespace: String,
        id: String,
        /// JSON text
        document: String,
    },
    CreateDatabase {
        name: String,
    },
    ShardCollection {
        namespace: String,
    },
    SplitChunk {
        namespace: String,
        at: String,
    },
    MovePrimary {
        database: String,
        to_shard: String,
    },
    CreateSessionsCollection,
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Noop => "noop",
            Mutation::AddShard { .. } => "add_shard",
            Mutation::InsertDocument { .. } => "insert_document",
            Mutation::CreateDatabase { .. } => "create_database",
            Mutation::ShardCollection { .. } => "shard_collection",
            Mutation::SplitChunk { .. } => "split_chunk",
            Mutation::MovePrimary { .. } => "move_primary",
            Mutation::CreateSessionsCollection => "create_sessions_collection",
        }
    }
}

/// Full catalog as of `version` (the last applied log index).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogState {
    pub version: u64,
    pub mode: TopologyMode,
    pub shards: BTreeMap<String, ShardEntry>,
    pub databases: BTreeMap<String, DatabaseEntry>,
    pub routes: BTreeMap<String, NamespaceRoute>,
    /// namespace -> `_id` -> JSON text
    pub documents: BTreeMap<String, BTreeMap<String, String>>,
    next_shard_ordinal: u64,
}

impl CatalogState {
    pub fn shard_by_target(&self, connection_target: &str) -> Option<&ShardEntry> {
        self.shards
            .values()
            .find(|s| s.connection_target == connection_target)
    }

    pub fn route(&self, namespace: &str) -> Option<&NamespaceRoute> {
        self.routes.get(namespace)
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseEntry> {
        self.databases.get(name)
    }

    pub fn document(&self, namespace: &str, id: &str) -> Option<&str> {
        self.documents
            .get(namespace)
            .and_then(|docs| docs.get(id))
            .map(String::as_str)
    }

    /// Shard hosting the fewest database primaries, ties broken by id.
    fn least_loaded_shard(&self) -> Option<String> {
        self.shards
            .keys()
            .min_by_key(|id| {
                let primaries = self
                    .databases
                    .values()
                    .filter(|db| &db.primary_shard == *id)
                    .count();
                (primaries, (*id).clone())
            })
            .cloned()
    }

    fn ensure_database(&mut self, name: &str) -> Option<String> {
        if let Some(db) = self.databases.get(name) {
            return Some(db.primary_shard.clone());
        }
        let primary = self.least_loaded_shard()?;
        self.databases.insert(
            name.to_string(),
            DatabaseEntry {
                db_name: name.to_string(),
                primary_shard: primary.clone(),
                version: 1,
            },
        );
        Some(primary)
    }

    /// Apply a committed mutation. Returns whether the catalog changed;
    /// mutations that would conflict with the current state are no-ops.
    pub fn apply(&mut self, index: u64, mutation: &Mutation) -> bool {
        self.version = index;
        match mutation {
            Mutation::Noop => false,
            Mutation::AddShard {
                connection_target,
                catalog_shard,
            } => {
                if self.shard_by_target(connection_target).is_some() {
                    return false;
                }
                let (shard_id, mode) = if *catalog_shard {
                    (CATALOG_SHARD_ID.to_string(), ShardMode::CatalogShard)
                } else {
                    let id = format!("shard{:04}", self.next_shard_ordinal);
                    self.next_shard_ordinal += 1;
                    (id, ShardMode::Dedicated)
                };
                if self.shards.contains_key(&shard_id) {
                    return false;
                }
                self.shards.insert(
                    shard_id.clone(),
                    ShardEntry {
                        shard_id,
                        connection_target: connection_target.clone(),
                        mode,
                        registered_at: index,
                    },
                );
                if *catalog_shard {
                    self.mode = TopologyMode::CatalogShard;
                }
                true
            }
            Mutation::InsertDocument {
                namespace,
                id,
                document,
            } => {
                let docs = self.documents.entry(namespace.clone()).or_default();
                if docs.contains_key(id) {
                    return false;
                }
                docs.insert(id.clone(), document.clone());
                true
            }
            Mutation::CreateDatabase { name } => {
                if self.databases.contains_key(name) {
                    return false;
                }
                self.ensure_database(name).is_some()
            }
            Mutation::ShardCollection { namespace } => {
                if self.routes.contains_key(namespace) {
                    return false;
                }
                let Some(db) = database_of(namespace) else {
                    return false;
                };
                let Some(primary) = self.ensure_database(db) else {
                    return false;
                };
                self.routes.insert(
                    namespace.clone(),
                    NamespaceRoute::single_chunk(namespace, &primary),
                );
                true
            }
            Mutation::SplitChunk { namespace, at } => self
                .routes
                .get_mut(namespace)
                .map(|route| route.split_at(at))
                .unwrap_or(false),
            Mutation::MovePrimary { database, to_shard } => {
                if !self.shards.contains_key(to_shard) {
                    return false;
                }
                match self.databases.get_mut(database) {
                    Some(db) if &db.primary_shard != to_shard => {
                        db.primary_shard = to_shard.clone();
                        db.version += 1;
                        true
                    }
                    _ => false,
                }
            }
            Mutation::CreateSessionsCollection => {
                if self.routes.contains_key(SESSIONS_NAMESPACE) {
                    return false;
                }
                let owner = if self.shards.contains_key(CATALOG_SHARD_ID) {
                    Some(CATALOG_SHARD_ID.to_string())
                } else {
                    self.shards.keys().next().cloned()
                };
                let Some(owner) = owner else {
                    return false;
                };
                self.routes.insert(
                    SESSIONS_NAMESPACE.to_string(),
                    NamespaceRoute::single_chunk(SESSIONS_NAMESPACE, &owner),
                );
                true
            }
        }
    }
}

//! Catalog model and durable log storage
//!
//! The catalog (shards, databases, namespace routes, topology mode and
//! directly written documents) is a deterministic function of the committed
//! log; members persist both the log and a checkpoint of the applied state.

pub mod storage;
pub mod target;
pub mod types;

pub use storage::{Checkpoint, DurableState, LogStorage, MemLogStorage, RocksLogStorage};
pub use target::ConnectionTarget;
pub use types::{
    database_of, CatalogState, Chunk, ChunkBound, DatabaseEntry, Mutation, NamespaceRoute,
    ShardEntry, ShardMode, TopologyMode, CATALOG_SHARD_ID, SESSIONS_NAMESPACE,
};

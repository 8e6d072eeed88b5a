//! Replicated metadata log for the config replica set
//!
//! Every catalog mutation goes through a single totally ordered log,
//! replicated with Raft across the config replica members. A write is
//! acknowledged once stored on a majority; reads are served by a leader
//! that has confirmed its leadership with a majority.

pub mod client;
pub mod node;
pub mod transport;

pub use client::MetadataClient;
pub use node::{RaftRole, ReplicaNode};
pub use transport::{HttpTransport, LocalTransport, ReplicaTransport};

use crate::catalog::{CatalogState, Mutation};
use crate::common::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Replication view of one member.
#[derive(Debug, Clone, Serialize)]
pub struct LeaderStatus {
    pub member: String,
    pub role: RaftRole,
    pub term: u64,
    pub leader: Option<String>,
    pub commit_index: u64,
    pub last_log_index: u64,
}

/// Majority-committed log of catalog mutations.
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Append a mutation and wait until a majority stores it. Returns the
    /// committed log index.
    ///
    /// A cancellation observed before the entry is admitted has no effect.
    /// Once admitted, the entry's fate follows the log and the caller sees
    /// [`crate::Error::Cancelled`].
    async fn append(&self, mutation: Mutation, cancel: &CancellationToken) -> Result<u64>;

    /// Catalog as of at least every write acknowledged before the call.
    async fn read(&self) -> Result<Arc<CatalogState>>;

    fn leader_status(&self) -> LeaderStatus;
}

/// Resolves the member currently accepting writes.
pub trait LeaderLocator: Send + Sync {
    fn primary(&self) -> Result<Arc<dyn ReplicatedLog>>;

    /// Whether `member` runs in this process.
    fn hosts(&self, _member: &str) -> bool {
        true
    }
}

//! Config server coordination
//!
//! The coordinator is responsible for:
//! - Shard registration and catalog operations (via the replicated log)
//! - Replica member lifecycle (start, restart, quarantine)
//! - Leader election orchestration and cluster phase
//! - Logical session collection bootstrap
//! - Admin and replication HTTP endpoints

pub mod admin;
pub mod http;
pub mod registry;
pub mod replica_set;
pub mod server;
pub mod sessions;
pub mod topology;

pub use admin::AdminService;
pub use registry::{AddShardOutcome, ShardRegistry};
pub use replica_set::{MemberHealth, MemberStatus, ReplicaSet};
pub use server::CatalogServer;
pub use sessions::{LogicalSessionCache, RefreshReport, SessionCollectionStatus, SessionRegistryTrigger};
pub use topology::{Phase, RestartOutcome, TopologyCoordinator, TopologyStatus};

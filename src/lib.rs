//! # minicatalog
//!
//! Replicated metadata catalog for a sharded cluster:
//! - Raft-replicated log of shard membership and data placement
//! - Idempotent shard registration, including the config replica set
//!   registering itself as a shard ("catalog shard" mode)
//! - Per-process routing and database caches, invalidated by explicit flush
//! - Election, restart and step-up orchestration for the config replica set
//! - Sessions collection bootstrap once shards exist
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Config Replica Set                │
//! │  (Raft log of catalog mutations)         │
//! │   - Leader: appends, confirms reads      │
//! │   - Followers: replicate, catch up       │
//! └───────────┬──────────────────────────────┘
//!             │ majority-confirmed reads
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───▼──────────┐
//! │ Shard      │   │ Routing    │   │ Database     │
//! │ Registry   │   │ Cache      │   │ Cache        │
//! │ (addShard) │   │ (flush)    │   │ (flush)      │
//! └────────────┘   └────────────┘   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a config replica member
//! ```bash
//! minicatalog-config serve \
//!   --id cfg-0 \
//!   --bind 0.0.0.0:7000 \
//!   --data ./catalog-data \
//!   --member cfg-0=http://10.0.0.1:7000 \
//!   --member cfg-1=http://10.0.0.2:7000 \
//!   --member cfg-2=http://10.0.0.3:7000
//! ```
//!
//! ### Use the CLI
//! ```bash
//! minicatalog add-shard configRS/10.0.0.1:7000,10.0.0.2:7000,10.0.0.3:7000
//! minicatalog flush-routing foo.bar
//! minicatalog step-up cfg-1
//! minicatalog status
//! ```

pub mod cache;
pub mod catalog;
pub mod common;
pub mod coordinator;
pub mod replication;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{AdminService, CatalogServer};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");

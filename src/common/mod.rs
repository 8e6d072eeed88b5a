//! Common utilities and types shared across minicatalog

pub mod config;
pub mod error;
pub mod metrics;
pub mod raft;
pub mod utils;

pub use config::{CacheConfig, Config, MemberSpec, ReplicationConfig, ServerConfig, StorageKind};
pub use error::{Error, Result};
pub use metrics::MetricsRegistry;
pub use utils::{jittered, retry_with_backoff, retry_with_backoff_while};

//! Configuration for minicatalog components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Member ID of this process in the config replica set
    pub node_id: String,

    /// Logging level
    pub log_level: String,

    pub replication: ReplicationConfig,

    pub server: ServerConfig,

    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "cfg-0".to_string(),
            log_level: default_log_level(),
            replication: ReplicationConfig::default(),
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from an optional TOML file, then `MINICATALOG__*`
    /// environment variables (e.g. `MINICATALOG__REPLICATION__WRITE_TIMEOUT_MS`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MINICATALOG")
                .prefix_separator("__")
                .separator("__"),
        );

        let loaded = builder
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let config: Config = loaded
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::InvalidConfig("node_id cannot be empty".into()));
        }
        self.replication.validate()?;
        if !self.server.members.is_empty()
            && !self.server.members.iter().any(|m| m.id == self.node_id)
        {
            return Err(Error::InvalidConfig(format!(
                "node_id {} is not listed in server.members",
                self.node_id
            )));
        }
        Ok(())
    }
}

/// Consensus timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Leader heartbeat (and catch-up replication) interval
    pub heartbeat_interval_ms: u64,

    /// Base election timeout; the effective timeout is randomized in
    /// `[base, 2 * base)` and doubled after every failed election
    pub election_timeout_ms: u64,

    /// Maximum doublings of the election timeout after failed elections
    pub max_election_backoff: u32,

    /// Bound on waiting for majority acknowledgment of a write
    pub write_timeout_ms: u64,

    /// Bound on a single replication RPC
    pub rpc_timeout_ms: u64,

    /// Window within which a restarted member must catch up
    pub rejoin_timeout_ms: u64,

    /// Maximum entries shipped in one AppendEntries request
    pub max_append_entries: usize,

    /// Attempts made by callers retrying NotPrimary / Timeout
    pub retry_attempts: usize,

    pub retry_delay_ms: u64,
}

/// Upper bound on `max_election_backoff`; the timeout doubles per step
pub const MAX_ELECTION_BACKOFF: u32 = 16;

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 50,
            election_timeout_ms: 300,
            max_election_backoff: 4,
            write_timeout_ms: 5_000,
            rpc_timeout_ms: 200,
            rejoin_timeout_ms: 10_000,
            max_append_entries: 256,
            retry_attempts: 8,
            retry_delay_ms: 50,
        }
    }
}

impl ReplicationConfig {
    /// Timings tuned for members that share one process.
    pub fn local() -> Self {
        Self {
            heartbeat_interval_ms: 10,
            election_timeout_ms: 60,
            max_election_backoff: 3,
            write_timeout_ms: 2_000,
            rpc_timeout_ms: 50,
            rejoin_timeout_ms: 3_000,
            max_append_entries: 256,
            retry_attempts: 12,
            retry_delay_ms: 10,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.election_timeout_ms <= self.heartbeat_interval_ms {
            return Err(Error::InvalidConfig(format!(
                "election_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.election_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.max_election_backoff > MAX_ELECTION_BACKOFF {
            return Err(Error::InvalidConfig(format!(
                "max_election_backoff ({}) must not exceed {}",
                self.max_election_backoff, MAX_ELECTION_BACKOFF
            )));
        }
        if self.max_append_entries == 0 {
            return Err(Error::InvalidConfig(
                "max_append_entries must be positive".into(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(Error::InvalidConfig("retry_attempts must be positive".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// Longest election timeout a member can draw, with full backoff.
    pub fn max_election_timeout(&self) -> Duration {
        self.election_timeout() * 2 * (1u32 << self.max_election_backoff.min(MAX_ELECTION_BACKOFF))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn rejoin_timeout(&self) -> Duration {
        Duration::from_millis(self.rejoin_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Where a member keeps its durable log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Rocksdb,
}

/// One member of the config replica set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSpec {
    pub id: String,
    /// Base URL of the member's HTTP API, e.g. `http://10.0.0.1:7000`
    pub url: String,
}

impl MemberSpec {
    /// Parse `id=url`.
    pub fn parse(s: &str) -> Result<Self> {
        let (id, url) = s
            .split_once('=')
            .ok_or_else(|| Error::InvalidConfig(format!("expected id=url, got {}", s)))?;
        let (id, url) = (id.trim(), url.trim());
        if id.is_empty() || url.is_empty() {
            return Err(Error::InvalidConfig(format!("expected id=url, got {}", s)));
        }
        Ok(Self {
            id: id.to_string(),
            url: url.trim_end_matches('/').to_string(),
        })
    }

    /// `host:port` part of the URL.
    pub fn host(&self) -> &str {
        let without_scheme = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        without_scheme.split('/').next().unwrap_or(without_scheme)
    }
}

/// Server process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP API (admin + replication)
    pub bind_addr: SocketAddr,

    /// Data directory for the RocksDB log
    pub data_dir: PathBuf,

    /// Replica set name, used to build the config connection target
    pub set_name: String,

    /// All members of the config replica set, this process included
    pub members: Vec<MemberSpec>,

    pub storage: StorageKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
            data_dir: PathBuf::from("./catalog-data"),
            set_name: "configRS".to_string(),
            members: Vec::new(),
            storage: StorageKind::Rocksdb,
        }
    }
}

impl ServerConfig {
    /// Connection target of the config replica set, `set/host1,host2`.
    pub fn connection_target(&self) -> String {
        let hosts: Vec<&str> = self.members.iter().map(|m| m.host()).collect();
        format!("{}/{}", self.set_name, hosts.join(","))
    }
}

/// Routing / database cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Reload attempts made by `get_at_least` before serving the freshest
    /// snapshot it has
    pub stale_retry_attempts: usize,

    pub stale_retry_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_retry_attempts: 5,
            stale_retry_delay_ms: 20,
        }
    }
}

impl CacheConfig {
    pub fn stale_retry_delay(&self) -> Duration {
        Duration::from_millis(self.stale_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
        assert!(ReplicationConfig::local().validate().is_ok());
    }

    #[test]
    fn test_election_must_exceed_heartbeat() {
        let cfg = ReplicationConfig {
            election_timeout_ms: 10,
            heartbeat_interval_ms: 10,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_replication_bounds() {
        let cfg = ReplicationConfig {
            max_election_backoff: 32,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
        let cfg = ReplicationConfig {
            max_election_backoff: MAX_ELECTION_BACKOFF,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
        let cfg = ReplicationConfig {
            max_append_entries: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_member_spec() {
        let m = MemberSpec::parse("cfg-1=http://10.0.0.1:7000/").unwrap();
        assert_eq!(m.id, "cfg-1");
        assert_eq!(m.url, "http://10.0.0.1:7000");
        assert_eq!(m.host(), "10.0.0.1:7000");
        assert!(MemberSpec::parse("nope").is_err());
        assert!(MemberSpec::parse("=http://x").is_err());
    }

    #[test]
    fn test_connection_target() {
        let server = ServerConfig {
            members: vec![
                MemberSpec::parse("a=http://h1:7000").unwrap(),
                MemberSpec::parse("b=http://h2:7000").unwrap(),
            ],
            ..Default::default()
        };
        assert_eq!(server.connection_target(), "configRS/h1:7000,h2:7000");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
node_id = "cfg-1"
[replication]
write_timeout_ms = 1234
[server]
set_name = "cfg"
storage = "memory"
members = [{{ id = "cfg-1", url = "http://127.0.0.1:7001" }}]
"#
        )
        .unwrap();

        let cfg = Config::load(Some(file.path())).unwrap();
        assert_eq!(cfg.node_id, "cfg-1");
        assert_eq!(cfg.replication.write_timeout_ms, 1234);
        assert_eq!(cfg.replication.heartbeat_interval_ms, 50);
        assert_eq!(cfg.server.storage, StorageKind::Memory);
        assert_eq!(cfg.server.connection_target(), "cfg/127.0.0.1:7001");
    }
}

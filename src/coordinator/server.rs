//! Catalog server: wires the replica set, catalog services and HTTP API

use crate::cache::{DatabaseCache, RoutingCache};
use crate::catalog::{LogStorage, MemLogStorage, RocksLogStorage};
use crate::common::{
    Config, Error, MemberSpec, MetricsRegistry, ReplicationConfig, Result, StorageKind,
};
use crate::coordinator::admin::AdminService;
use crate::coordinator::http::{create_router, AppState};
use crate::coordinator::registry::ShardRegistry;
use crate::coordinator::replica_set::ReplicaSet;
use crate::coordinator::sessions::{LogicalSessionCache, SessionRegistryTrigger};
use crate::coordinator::topology::TopologyCoordinator;
use crate::replication::{HttpTransport, LeaderLocator, MetadataClient};
use std::collections::HashMap;
use std::sync::Arc;

pub struct CatalogServer {
    config: Config,
    replica_set: Arc<ReplicaSet>,
    topology: Arc<TopologyCoordinator>,
    admin: Arc<AdminService>,
}

impl CatalogServer {
    fn assemble(
        config: Config,
        replica_set: ReplicaSet,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let replica_set = Arc::new(replica_set);
        let locator: Arc<dyn LeaderLocator> = replica_set.clone();
        let client = MetadataClient::new(locator, config.replication.clone());

        let registry = Arc::new(ShardRegistry::new(
            client.clone(),
            &config.server.connection_target(),
            metrics.clone(),
        )?);
        let routing = Arc::new(RoutingCache::new(
            client.clone(),
            config.cache.clone(),
            metrics.clone(),
        ));
        let databases = Arc::new(DatabaseCache::new(
            client.clone(),
            config.cache.clone(),
            metrics.clone(),
        ));
        let sessions = Arc::new(LogicalSessionCache::new(
            SessionRegistryTrigger::new(client),
            routing.clone(),
            metrics.clone(),
        ));
        let topology = Arc::new(TopologyCoordinator::new(
            replica_set.clone(),
            config.replication.clone(),
            metrics.clone(),
        ));
        let admin = Arc::new(AdminService::new(
            registry,
            routing,
            databases,
            sessions,
            topology.clone(),
            metrics,
        ));

        Ok(Self {
            config,
            replica_set,
            topology,
            admin,
        })
    }

    /// A whole replica set in this process with in-memory logs, members
    /// named `<set>-0`, `<set>-1`, ...
    pub fn in_memory(
        set_name: &str,
        members: usize,
        replication: ReplicationConfig,
    ) -> Result<Self> {
        if members == 0 {
            return Err(Error::InvalidConfig(
                "replica set needs at least one member".into(),
            ));
        }
        let specs: Vec<MemberSpec> = (0..members)
            .map(|i| MemberSpec {
                id: format!("{}-{}", set_name, i),
                url: format!("http://{}-{}.local:{}", set_name, i, 27019),
            })
            .collect();
        let mut config = Config::default();
        config.node_id = specs[0].id.clone();
        config.replication = replication;
        config.server.set_name = set_name.to_string();
        config.server.members = specs.clone();
        config.server.storage = StorageKind::Memory;
        config.validate()?;

        let metrics = Arc::new(MetricsRegistry::new());
        let ids = specs.into_iter().map(|m| m.id).collect();
        let replica_set = ReplicaSet::in_memory(ids, config.replication.clone(), metrics.clone())?;
        Self::assemble(config, replica_set, metrics)
    }

    /// One member of a replica set spread over processes, talking HTTP to
    /// its peers. Without configured members the process forms a
    /// single-member set on its bind address.
    pub fn from_config(mut config: Config) -> Result<Self> {
        if config.server.members.is_empty() {
            config.server.members.push(MemberSpec {
                id: config.node_id.clone(),
                url: format!("http://{}", config.server.bind_addr),
            });
        }
        config.validate()?;

        let storage: Arc<dyn LogStorage> = match config.server.storage {
            StorageKind::Memory => Arc::new(MemLogStorage::new()),
            StorageKind::Rocksdb => {
                let path = config.server.data_dir.join(&config.node_id);
                std::fs::create_dir_all(&config.server.data_dir)?;
                Arc::new(RocksLogStorage::open(path)?)
            }
        };
        let transport = Arc::new(HttpTransport::new(
            &config.server.members,
            config.replication.rpc_timeout(),
        )?);
        let metrics = Arc::new(MetricsRegistry::new());
        let ids = config.server.members.iter().map(|m| m.id.clone()).collect();
        let replica_set = ReplicaSet::new(
            ids,
            vec![(config.node_id.clone(), storage)],
            transport,
            config.replication.clone(),
            metrics.clone(),
        )?;
        Self::assemble(config, replica_set, metrics)
    }

    /// Start local members and the topology monitor.
    pub fn start(&self) {
        self.replica_set.start();
        self.topology.start_monitor();
    }

    pub fn admin(&self) -> Arc<AdminService> {
        self.admin.clone()
    }

    pub fn replica_set(&self) -> Arc<ReplicaSet> {
        self.replica_set.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Normalized connection target of this replica set.
    pub fn connection_target(&self) -> &str {
        self.admin.registry().config_target()
    }

    pub fn router(&self) -> axum::Router {
        let member_urls: HashMap<String, String> = self
            .config
            .server
            .members
            .iter()
            .map(|m| (m.id.clone(), m.url.clone()))
            .collect();
        create_router(AppState {
            admin: self.admin.clone(),
            replica_set: self.replica_set.clone(),
            member_id: self.config.node_id.clone(),
            member_urls: Arc::new(member_urls),
        })
    }

    pub fn shutdown(&self) {
        self.topology.shutdown();
    }

    /// Start and serve the HTTP API until Ctrl-C.
    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.server.bind_addr).await?;
        self.serve_on(listener).await
    }

    /// Like [`serve`](Self::serve) on an already bound listener.
    pub async fn serve_on(self, listener: tokio::net::TcpListener) -> Result<()> {
        tracing::info!(member = %self.config.node_id, "starting config replica member");
        tracing::info!("  HTTP API: {}", listener.local_addr()?);
        tracing::info!("  Replica set: {}", self.connection_target());
        tracing::info!(
            "  Storage: {:?} at {}",
            self.config.server.storage,
            self.config.server.data_dir.display()
        );

        self.start();
        tracing::info!("✓ Config replica member ready");

        let res = axum::serve(listener, self.router())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested");
            })
            .await;
        self.shutdown();
        res.map_err(Error::from)
    }
}

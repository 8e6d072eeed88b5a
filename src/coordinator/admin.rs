//! Administrative commands, shared by the HTTP API and embedders

use crate::cache::{DatabaseCache, RoutingCache};
use crate::catalog::{DatabaseEntry, NamespaceRoute, ShardEntry, TopologyMode};
use crate::common::{MetricsRegistry, Result};
use crate::coordinator::registry::{AddShardOutcome, ShardRegistry};
use crate::coordinator::sessions::{LogicalSessionCache, RefreshReport, SessionCollectionStatus};
use crate::coordinator::topology::{RestartOutcome, TopologyCoordinator, TopologyStatus};
use crate::replication::LeaderStatus;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct AdminService {
    registry: Arc<ShardRegistry>,
    routing: Arc<RoutingCache>,
    databases: Arc<DatabaseCache>,
    sessions: Arc<LogicalSessionCache>,
    topology: Arc<TopologyCoordinator>,
    metrics: Arc<MetricsRegistry>,
}

impl AdminService {
    pub fn new(
        registry: Arc<ShardRegistry>,
        routing: Arc<RoutingCache>,
        databases: Arc<DatabaseCache>,
        sessions: Arc<LogicalSessionCache>,
        topology: Arc<TopologyCoordinator>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            registry,
            routing,
            databases,
            sessions,
            topology,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn routing(&self) -> &Arc<RoutingCache> {
        &self.routing
    }

    pub fn databases(&self) -> &Arc<DatabaseCache> {
        &self.databases
    }

    pub fn sessions(&self) -> &Arc<LogicalSessionCache> {
        &self.sessions
    }

    pub fn topology(&self) -> &Arc<TopologyCoordinator> {
        &self.topology
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    async fn run<T, F>(&self, command: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let res = fut.await;
        if let Err(e) = &res {
            self.metrics.admin_errors.inc();
            warn!(command, code = e.code(), error = %e, "admin command failed");
        }
        res
    }

    pub async fn add_shard(&self, connection_target: &str) -> Result<AddShardOutcome> {
        self.run("addShard", self.registry.add_shard(connection_target))
            .await
    }

    /// Always succeeds, including for namespaces with no metadata.
    pub async fn flush_routing_table_cache_updates(&self, namespace: &str) {
        self.routing.flush(namespace).await;
    }

    /// Always succeeds, including for databases with no metadata.
    pub async fn flush_database_cache_updates(&self, db_name: &str) {
        self.databases.flush(db_name).await;
    }

    pub async fn refresh_logical_session_cache_now(&self) -> Result<RefreshReport> {
        self.run("refreshLogicalSessionCacheNow", self.sessions.refresh_now())
            .await
    }

    pub async fn ensure_session_collection(&self) -> Result<SessionCollectionStatus> {
        self.run(
            "ensureSessionCollection",
            self.sessions.trigger().ensure_session_collection(),
        )
        .await
    }

    pub async fn step_up(&self, member: &str) -> Result<LeaderStatus> {
        self.run("stepUp", self.topology.step_up(member)).await
    }

    pub async fn restart(
        &self,
        member: &str,
        preserve_state: bool,
        wait: bool,
    ) -> Result<RestartOutcome> {
        self.run(
            "restart",
            self.topology.restart(member, preserve_state, wait),
        )
        .await
    }

    pub async fn await_stable_leader(&self, timeout: Duration) -> Result<LeaderStatus> {
        self.run("getPrimary", self.topology.await_stable_leader(timeout))
            .await
    }

    pub async fn insert(&self, namespace: &str, document: serde_json::Value) -> Result<String> {
        self.run(
            "insert",
            self.registry.insert_document(namespace, document),
        )
        .await
    }

    pub async fn find_one(&self, namespace: &str, id: &str) -> Result<Option<serde_json::Value>> {
        self.run("find", self.registry.find_document(namespace, id))
            .await
    }

    pub async fn create_database(&self, name: &str) -> Result<DatabaseEntry> {
        self.run("createDatabase", self.registry.create_database(name))
            .await
    }

    pub async fn shard_collection(&self, namespace: &str) -> Result<NamespaceRoute> {
        self.run("shardCollection", self.registry.shard_collection(namespace))
            .await
    }

    pub async fn split_chunk(&self, namespace: &str, at: &str) -> Result<NamespaceRoute> {
        self.run("split", self.registry.split_chunk(namespace, at))
            .await
    }

    pub async fn move_primary(&self, database: &str, to_shard: &str) -> Result<DatabaseEntry> {
        self.run("movePrimary", self.registry.move_primary(database, to_shard))
            .await
    }

    pub async fn list_shards(&self) -> Result<Vec<ShardEntry>> {
        self.run("listShards", self.registry.list_shards()).await
    }

    pub async fn topology_mode(&self) -> Result<TopologyMode> {
        self.run("topologyMode", self.registry.topology_mode()).await
    }

    pub fn status(&self) -> TopologyStatus {
        self.topology.status()
    }
}

//! Logical sessions: the sessions collection trigger and the local cache
//!
//! The trigger reads the authoritative catalog, never a cache, so it is safe
//! right after the switch to catalog-shard mode while routing caches still
//! hold older snapshots.

use crate::cache::RoutingCache;
use crate::catalog::{Mutation, SESSIONS_NAMESPACE};
use crate::common::{MetricsRegistry, Result};
use crate::replication::MetadataClient;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCollectionStatus {
    AlreadyExists,
    Created,
    /// No shard can host the collection yet; not an error
    NoShards,
}

pub struct SessionRegistryTrigger {
    client: MetadataClient,
}

impl SessionRegistryTrigger {
    pub fn new(client: MetadataClient) -> Self {
        Self { client }
    }

    /// Make sure the sessions collection exists once a shard does.
    pub async fn ensure_session_collection(&self) -> Result<SessionCollectionStatus> {
        let catalog = self.client.read().await?;
        if catalog.route(SESSIONS_NAMESPACE).is_some() {
            return Ok(SessionCollectionStatus::AlreadyExists);
        }
        if catalog.shards.is_empty() {
            debug!("no shards yet, sessions collection deferred");
            return Ok(SessionCollectionStatus::NoShards);
        }

        self.client.append(Mutation::CreateSessionsCollection).await?;
        let catalog = self.client.read().await?;
        match catalog.route(SESSIONS_NAMESPACE) {
            Some(route) => {
                let owner = route
                    .chunks
                    .first()
                    .map(|c| c.shard_id.as_str())
                    .unwrap_or_default();
                info!(namespace = SESSIONS_NAMESPACE, owner, "created sessions collection");
                Ok(SessionCollectionStatus::Created)
            }
            None => Ok(SessionCollectionStatus::NoShards),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub collection: SessionCollectionStatus,
    pub active_sessions: usize,
    /// Shard id -> sessions it owns
    pub sessions_by_shard: BTreeMap<String, usize>,
    /// Sessions ended since the previous refresh
    pub ended: usize,
}

/// Process-local logical session cache.
pub struct LogicalSessionCache {
    trigger: SessionRegistryTrigger,
    routing: Arc<RoutingCache>,
    metrics: Arc<MetricsRegistry>,
    active: Mutex<HashMap<Uuid, SessionRecord>>,
    ended: Mutex<Vec<Uuid>>,
}

impl LogicalSessionCache {
    pub fn new(
        trigger: SessionRegistryTrigger,
        routing: Arc<RoutingCache>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            trigger,
            routing,
            metrics,
            active: Mutex::new(HashMap::new()),
            ended: Mutex::new(Vec::new()),
        }
    }

    pub fn trigger(&self) -> &SessionRegistryTrigger {
        &self.trigger
    }

    pub fn start_session(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.active.lock().insert(
            id,
            SessionRecord {
                id,
                started_at: Utc::now(),
            },
        );
        id
    }

    pub fn end_session(&self, id: Uuid) -> bool {
        let removed = self.active.lock().remove(&id).is_some();
        if removed {
            self.ended.lock().push(id);
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// `refreshLogicalSessionCacheNow`: ensure the sessions collection and
    /// group active sessions by the shard owning them.
    pub async fn refresh_now(&self) -> Result<RefreshReport> {
        self.metrics.session_refreshes.inc();
        let collection = self.trigger.ensure_session_collection().await?;

        let ids: Vec<Uuid> = self.active.lock().keys().copied().collect();
        let mut sessions_by_shard = BTreeMap::new();
        if collection != SessionCollectionStatus::NoShards {
            // A snapshot cached before the collection existed is absent
            // (version 0) and gets reloaded here.
            let snapshot = self.routing.get_at_least(SESSIONS_NAMESPACE, 1).await?;
            if let Some(route) = snapshot.data.as_ref() {
                for id in &ids {
                    if let Some(chunk) = route.find_intersecting_chunk(&id.to_string()) {
                        *sessions_by_shard.entry(chunk.shard_id.clone()).or_insert(0) += 1;
                    }
                }
            }
        }
        let ended = std::mem::take(&mut *self.ended.lock()).len();

        debug!(
            ?collection,
            active = ids.len(),
            ended,
            "refreshed logical session cache"
        );
        Ok(RefreshReport {
            collection,
            active_sessions: ids.len(),
            sessions_by_shard,
            ended,
        })
    }
}

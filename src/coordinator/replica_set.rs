//! Config replica set: member lifecycle and leader location
//!
//! Owns the members hosted by this process, their durable storage (kept
//! across restarts) and their health. Members hosted elsewhere are reached
//! only through the transport.

use crate::catalog::{CatalogState, LogStorage, MemLogStorage};
use crate::common::{Error, MetricsRegistry, ReplicationConfig, Result};
use crate::replication::{
    LeaderLocator, LeaderStatus, LocalTransport, RaftRole, ReplicaNode, ReplicaTransport,
    ReplicatedLog,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberHealth {
    Healthy,
    Restarting,
    /// Did not rejoin within the rejoin window
    Degraded,
    /// Durable state failed validation; not running
    Quarantined,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub id: String,
    pub health: MemberHealth,
    pub running: bool,
    pub role: Option<RaftRole>,
    pub term: u64,
    pub commit_index: u64,
    pub last_log_index: u64,
    /// Wiped on restart and not yet caught up; cannot vote
    pub catching_up: bool,
    pub last_error: Option<String>,
}

struct MemberSlot {
    storage: Arc<dyn LogStorage>,
    node: Option<Arc<ReplicaNode>>,
    task: Option<JoinHandle<()>>,
    health: MemberHealth,
    last_error: Option<String>,
}

pub struct ReplicaSet {
    members: Vec<String>,
    slots: RwLock<BTreeMap<String, MemberSlot>>,
    transport: Arc<dyn ReplicaTransport>,
    local_transport: Option<Arc<LocalTransport>>,
    config: ReplicationConfig,
    metrics: Arc<MetricsRegistry>,
}

impl ReplicaSet {
    /// `local` lists the members hosted by this process with their storage.
    pub fn new(
        members: Vec<String>,
        local: Vec<(String, Arc<dyn LogStorage>)>,
        transport: Arc<dyn ReplicaTransport>,
        config: ReplicationConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::InvalidConfig("replica set has no members".into()));
        }
        let mut slots = BTreeMap::new();
        for (id, storage) in local {
            if !members.contains(&id) {
                return Err(Error::UnknownMember(id));
            }
            slots.insert(
                id,
                MemberSlot {
                    storage,
                    node: None,
                    task: None,
                    health: MemberHealth::Restarting,
                    last_error: None,
                },
            );
        }
        Ok(Self {
            members,
            slots: RwLock::new(slots),
            transport,
            local_transport: None,
            config,
            metrics,
        })
    }

    /// Every member in this process, in-memory storage and transport.
    pub fn in_memory(
        members: Vec<String>,
        config: ReplicationConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let transport = Arc::new(LocalTransport::new());
        let local = members
            .iter()
            .map(|id| {
                let storage: Arc<dyn LogStorage> = Arc::new(MemLogStorage::new());
                (id.clone(), storage)
            })
            .collect();
        let mut set = Self::new(members, local, transport.clone(), config, metrics)?;
        set.local_transport = Some(transport);
        Ok(set)
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_local(&self, member: &str) -> bool {
        self.slots.read().contains_key(member)
    }

    /// In-process transport, when every member lives in this process.
    pub fn local_transport(&self) -> Option<Arc<LocalTransport>> {
        self.local_transport.clone()
    }

    /// Start every local member that is not running yet.
    pub fn start(&self) {
        let ids: Vec<String> = self.slots.read().keys().cloned().collect();
        for id in ids {
            if self.node(&id).is_some() {
                continue;
            }
            match self.start_member(&id) {
                Ok(_) => self.set_health(&id, MemberHealth::Healthy),
                Err(e) => error!(member = %id, error = %e, "member failed to start"),
            }
        }
    }

    fn start_member(&self, id: &str) -> Result<Arc<ReplicaNode>> {
        let storage = self
            .slots
            .read()
            .get(id)
            .map(|slot| slot.storage.clone())
            .ok_or_else(|| Error::UnknownMember(id.to_string()))?;

        let recovered = ReplicaNode::recover(
            id,
            &self.members,
            self.config.clone(),
            self.transport.clone(),
            storage,
            self.metrics.clone(),
        );

        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| Error::UnknownMember(id.to_string()))?;
        match recovered {
            Ok(node) => {
                self.transport.attach(node.clone());
                slot.task = Some(node.start());
                slot.node = Some(node.clone());
                slot.last_error = None;
                info!(member = %id, "member started");
                Ok(node)
            }
            Err(e) => {
                slot.health = match e {
                    Error::Corrupted(_) => MemberHealth::Quarantined,
                    _ => MemberHealth::Degraded,
                };
                slot.last_error = Some(e.to_string());
                error!(member = %id, health = ?slot.health, error = %e, "member could not recover");
                Err(e)
            }
        }
    }

    /// Stop a local member. Its storage is kept.
    pub fn stop_member(&self, id: &str) -> Result<()> {
        let (node, task) = {
            let mut slots = self.slots.write();
            let slot = slots
                .get_mut(id)
                .ok_or_else(|| Error::UnknownMember(id.to_string()))?;
            (slot.node.take(), slot.task.take())
        };
        if let Some(node) = node {
            node.shutdown();
            self.transport.detach(id);
        }
        if let Some(task) = task {
            task.abort();
        }
        info!(member = %id, "member stopped");
        Ok(())
    }

    /// Stop and start a local member from its durable state. Without
    /// `preserve_state` the durable state is wiped first and the member
    /// rejoins empty.
    pub fn restart_member(&self, id: &str, preserve_state: bool) -> Result<Arc<ReplicaNode>> {
        self.stop_member(id)?;
        self.metrics.member_restarts.inc();
        self.set_health(id, MemberHealth::Restarting);
        if !preserve_state {
            let storage = self
                .slots
                .read()
                .get(id)
                .map(|slot| slot.storage.clone())
                .ok_or_else(|| Error::UnknownMember(id.to_string()))?;
            storage.clear()?;
            warn!(member = %id, "durable state wiped before restart");
        }
        self.start_member(id)
    }

    pub fn node(&self, id: &str) -> Option<Arc<ReplicaNode>> {
        self.slots.read().get(id).and_then(|slot| slot.node.clone())
    }

    pub fn running_nodes(&self) -> Vec<Arc<ReplicaNode>> {
        self.slots
            .read()
            .values()
            .filter_map(|slot| slot.node.clone())
            .collect()
    }

    pub fn health(&self, id: &str) -> Option<MemberHealth> {
        self.slots.read().get(id).map(|slot| slot.health)
    }

    pub fn set_health(&self, id: &str, health: MemberHealth) {
        if let Some(slot) = self.slots.write().get_mut(id) {
            slot.health = health;
        }
    }

    /// Local leader that has committed an entry in its term, or, when the
    /// leader lives in another process, a local follower that knows it.
    pub fn stable_leader(&self) -> Option<LeaderStatus> {
        let nodes = self.running_nodes();
        if let Some(leader) = nodes
            .iter()
            .filter(|n| n.has_committed_in_term())
            .max_by_key(|n| n.term())
        {
            return Some(leader.status());
        }
        nodes.iter().find_map(|n| {
            let status = n.status();
            match &status.leader {
                Some(leader) if !self.is_local(leader) => Some(status),
                _ => None,
            }
        })
    }

    /// Highest commit index known to a running local member.
    pub fn known_commit_index(&self) -> u64 {
        self.running_nodes()
            .iter()
            .map(|n| n.commit_index())
            .max()
            .unwrap_or(0)
    }

    /// Most advanced locally applied catalog.
    pub fn local_catalog(&self) -> Arc<CatalogState> {
        self.running_nodes()
            .iter()
            .map(|n| n.local_catalog())
            .max_by_key(|c| c.version)
            .unwrap_or_default()
    }

    pub fn member_statuses(&self) -> Vec<MemberStatus> {
        let slots = self.slots.read();
        self.members
            .iter()
            .filter_map(|id| {
                let slot = slots.get(id)?;
                let status = slot.node.as_ref().map(|n| n.status());
                Some(MemberStatus {
                    id: id.clone(),
                    health: slot.health,
                    running: slot.node.is_some(),
                    role: status.as_ref().map(|s| s.role),
                    term: status.as_ref().map(|s| s.term).unwrap_or(0),
                    commit_index: status.as_ref().map(|s| s.commit_index).unwrap_or(0),
                    last_log_index: status.as_ref().map(|s| s.last_log_index).unwrap_or(0),
                    catching_up: slot.node.as_ref().is_some_and(|n| n.is_catching_up()),
                    last_error: slot.last_error.clone(),
                })
            })
            .collect()
    }

    /// Stop every local member.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.slots.read().keys().cloned().collect();
        for id in ids {
            let _ = self.stop_member(&id);
        }
    }
}

impl LeaderLocator for ReplicaSet {
    /// The local leader of the highest term. A leader cut off from the
    /// majority keeps its role until it notices, so several may coexist.
    fn primary(&self) -> Result<Arc<dyn ReplicatedLog>> {
        let nodes = self.running_nodes();
        if let Some(leader) = nodes
            .iter()
            .filter(|n| n.is_leader())
            .max_by_key(|n| n.term())
        {
            let log: Arc<dyn ReplicatedLog> = leader.clone();
            return Ok(log);
        }
        let hint = nodes.iter().find_map(|n| n.leader_hint());
        Err(Error::NotPrimary(hint))
    }

    fn hosts(&self, member: &str) -> bool {
        self.is_local(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(n: usize) -> ReplicaSet {
        let members = (0..n).map(|i| format!("cfg-{}", i)).collect();
        ReplicaSet::in_memory(
            members,
            ReplicationConfig::local(),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_local_member_rejected() {
        let res = ReplicaSet::new(
            vec!["cfg-0".into()],
            vec![("cfg-9".into(), Arc::new(MemLogStorage::new()) as Arc<dyn LogStorage>)],
            Arc::new(LocalTransport::new()),
            ReplicationConfig::local(),
            Arc::new(MetricsRegistry::new()),
        );
        assert!(matches!(res, Err(Error::UnknownMember(_))));
    }

    #[tokio::test]
    async fn test_primary_is_not_primary_before_election() {
        let set = set(3);
        set.start();
        assert_eq!(set.running_nodes().len(), 3);
        assert!(matches!(set.primary(), Err(Error::NotPrimary(None))));
        set.shutdown();
    }

    #[tokio::test]
    async fn test_elects_and_locates_leader() {
        let set = set(3);
        set.start();
        let leader = set.node("cfg-0").unwrap();
        assert!(leader.campaign().await.unwrap());
        let primary = set.primary().unwrap();
        assert_eq!(primary.leader_status().member, "cfg-0");
        assert_eq!(set.stable_leader().unwrap().member, "cfg-0");
        set.shutdown();
    }

    #[tokio::test]
    async fn test_restart_without_state_wipes_member() {
        let set = set(1);
        set.start();
        let node = set.node("cfg-0").unwrap();
        assert!(node.campaign().await.unwrap());
        assert!(node.last_log_index() > 0);

        let fresh = set.restart_member("cfg-0", false).unwrap();
        assert_eq!(fresh.last_log_index(), 0);
        assert_eq!(set.health("cfg-0"), Some(MemberHealth::Restarting));
        set.shutdown();
    }
}

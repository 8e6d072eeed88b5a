//! Topology coordinator: elections, restarts and cluster phase
//!
//! The phase is `Stable` while a leader that committed an entry in its own
//! term is known, `Electing` otherwise, and `Restarting` while any member
//! restarted through the coordinator has not caught up yet. The topology
//! mode itself lives in the replicated catalog and changes only through
//! shard registration.

use crate::catalog::TopologyMode;
use crate::common::{Error, MetricsRegistry, ReplicationConfig, Result};
use crate::coordinator::replica_set::{MemberHealth, MemberStatus, ReplicaSet};
use crate::replication::LeaderStatus;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "members", rename_all = "lowercase")]
pub enum Phase {
    Stable,
    Electing,
    Restarting(Vec<String>),
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologyStatus {
    pub mode: TopologyMode,
    pub phase: Phase,
    pub leader: Option<String>,
    pub term: u64,
    pub commit_index: u64,
    pub catalog_version: u64,
    pub shard_count: usize,
    pub members: Vec<MemberStatus>,
    pub observed_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartOutcome {
    pub member: String,
    /// False when the call returned before the member rejoined
    pub waited: bool,
    pub health: MemberHealth,
}

pub struct TopologyCoordinator {
    replica_set: Arc<ReplicaSet>,
    config: ReplicationConfig,
    metrics: Arc<MetricsRegistry>,
    phase: RwLock<Phase>,
    restarting: Mutex<BTreeSet<String>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl TopologyCoordinator {
    pub fn new(
        replica_set: Arc<ReplicaSet>,
        config: ReplicationConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            replica_set,
            config,
            metrics,
            phase: RwLock::new(Phase::Electing),
            restarting: Mutex::new(BTreeSet::new()),
            monitor: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn replica_set(&self) -> &Arc<ReplicaSet> {
        &self.replica_set
    }

    fn compute_phase(&self) -> Phase {
        let restarting: Vec<String> = self.restarting.lock().iter().cloned().collect();
        if !restarting.is_empty() {
            return Phase::Restarting(restarting);
        }
        match self.replica_set.stable_leader() {
            Some(_) => Phase::Stable,
            None => Phase::Electing,
        }
    }

    /// Recompute the phase, logging transitions.
    pub fn refresh_phase(&self) -> Phase {
        let next = self.compute_phase();
        let mut phase = self.phase.write();
        if *phase != next {
            info!(from = ?*phase, to = ?next, "topology phase changed");
            *phase = next.clone();
        }
        self.metrics
            .commit_index
            .set(self.replica_set.known_commit_index());
        next
    }

    pub fn phase(&self) -> Phase {
        self.phase.read().clone()
    }

    /// Spawn the task that tracks the phase every heartbeat.
    pub fn start_monitor(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let interval = coordinator.config.heartbeat_interval();
            loop {
                tokio::select! {
                    _ = coordinator.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                coordinator.refresh_phase();
            }
        });
        if let Some(previous) = self.monitor.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
        self.replica_set.shutdown();
    }

    /// Wait until a leader has committed in its term ("get primary").
    pub async fn await_stable_leader(&self, timeout: Duration) -> Result<LeaderStatus> {
        let wait = async {
            loop {
                if let Some(leader) = self.replica_set.stable_leader() {
                    return leader;
                }
                tokio::time::sleep(self.config.heartbeat_interval()).await;
            }
        };
        let leader = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout(format!("no stable leader within {:?}", timeout)))?;
        self.refresh_phase();
        Ok(leader)
    }

    /// Make `member` the leader. The member must first catch up with the
    /// commit index known when the call started, so no committed write is
    /// lost; failed campaigns are retried with a growing delay.
    pub async fn step_up(&self, member: &str) -> Result<LeaderStatus> {
        let node = self.replica_set.node(member).ok_or_else(|| {
            if self.replica_set.members().iter().any(|m| m == member) {
                Error::NotElectable {
                    member: member.to_string(),
                    reason: "member is not running in this process".into(),
                }
            } else {
                Error::UnknownMember(member.to_string())
            }
        })?;
        if node.has_committed_in_term() {
            return Ok(node.status());
        }

        let target = self.replica_set.known_commit_index();
        let caught_up = tokio::time::timeout(self.config.write_timeout(), node.wait_applied(target));
        if caught_up.await.is_err() {
            return Err(Error::NotElectable {
                member: member.to_string(),
                reason: format!(
                    "applied index {} behind commit index {}",
                    node.commit_index(),
                    target
                ),
            });
        }

        info!(member = %member, commit_index = target, "stepping up");
        let mut delay = self.config.election_timeout();
        for attempt in 1..=self.config.retry_attempts.max(1) {
            if node.campaign().await? {
                let committed = async {
                    while node.is_leader() && !node.has_committed_in_term() {
                        node.replicate_once().await?;
                        tokio::time::sleep(self.config.heartbeat_interval()).await;
                    }
                    Ok::<bool, Error>(node.has_committed_in_term())
                };
                if let Ok(Ok(true)) =
                    tokio::time::timeout(self.config.write_timeout(), committed).await
                {
                    self.refresh_phase();
                    info!(member = %member, term = node.term(), "step up complete");
                    return Ok(node.status());
                }
            }
            debug!(member = %member, attempt, ?delay, "step up attempt failed");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.config.max_election_timeout());
        }
        Err(Error::NotElectable {
            member: member.to_string(),
            reason: "could not win an election".into(),
        })
    }

    /// Restart a local member from its durable state (or empty when
    /// `preserve_state` is false). With `wait` the call returns once the
    /// member has caught up; otherwise it returns right after the restart
    /// and catch-up is tracked in the background.
    pub async fn restart(
        self: &Arc<Self>,
        member: &str,
        preserve_state: bool,
        wait: bool,
    ) -> Result<RestartOutcome> {
        if !self.replica_set.is_local(member) {
            return Err(Error::UnknownMember(member.to_string()));
        }
        let target = self.replica_set.known_commit_index();
        self.restarting.lock().insert(member.to_string());
        info!(member = %member, preserve_state, wait, "restarting member");

        if let Err(e) = self.replica_set.restart_member(member, preserve_state) {
            self.restarting.lock().remove(member);
            self.refresh_phase();
            return Err(e);
        }
        self.refresh_phase();

        let coordinator = Arc::clone(self);
        let id = member.to_string();
        let rejoin = async move {
            match coordinator.track_rejoin(&id, target).await {
                Some(health) => {
                    coordinator.restarting.lock().remove(&id);
                    coordinator.refresh_phase();
                    health
                }
                // Restarted again meanwhile; the newer restart owns the state
                None => coordinator
                    .replica_set
                    .health(&id)
                    .unwrap_or(MemberHealth::Restarting),
            }
        };

        if wait {
            let health = rejoin.await;
            Ok(RestartOutcome {
                member: member.to_string(),
                waited: true,
                health,
            })
        } else {
            tokio::spawn(rejoin);
            Ok(RestartOutcome {
                member: member.to_string(),
                waited: false,
                health: MemberHealth::Restarting,
            })
        }
    }

    /// Wait for `member` to catch up with `target`. Returns `None` when
    /// the member was restarted again before this restart settled.
    async fn track_rejoin(&self, member: &str, target: u64) -> Option<MemberHealth> {
        let Some(node) = self.replica_set.node(member) else {
            return Some(
                self.replica_set
                    .health(member)
                    .unwrap_or(MemberHealth::Degraded),
            );
        };
        let rejoined = async {
            node.wait_applied(target).await;
            while !node.is_leader() && node.leader_hint().is_none() {
                tokio::time::sleep(self.config.heartbeat_interval()).await;
            }
        };
        let health = match tokio::time::timeout(self.config.rejoin_timeout(), rejoined).await {
            Ok(()) => MemberHealth::Healthy,
            Err(_) => MemberHealth::Degraded,
        };

        let current = self.replica_set.node(member);
        if !current.is_some_and(|n| Arc::ptr_eq(&n, &node)) {
            return None;
        }
        match health {
            MemberHealth::Healthy => {
                info!(member = %member, commit_index = node.commit_index(), "member rejoined")
            }
            _ => warn!(
                member = %member,
                commit_index = node.commit_index(),
                target,
                "member did not rejoin in time"
            ),
        }
        self.replica_set.set_health(member, health);
        Some(health)
    }

    pub fn status(&self) -> TopologyStatus {
        let phase = self.refresh_phase();
        let catalog = self.replica_set.local_catalog();
        let leader = self.replica_set.stable_leader();
        TopologyStatus {
            mode: catalog.mode,
            phase,
            leader: leader.as_ref().and_then(|l| l.leader.clone()),
            term: leader.as_ref().map(|l| l.term).unwrap_or(0),
            commit_index: self.replica_set.known_commit_index(),
            catalog_version: catalog.version,
            shard_count: catalog.shards.len(),
            members: self.replica_set.member_statuses(),
            observed_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

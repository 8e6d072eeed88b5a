//! Raft replica member of the config replica set
//!
//! Each member keeps its log and the catalog applied from it. The leader
//! replicates entries with `AppendEntries`, which doubles as heartbeat and
//! catch-up for lagging or restarted members. An entry commits once stored
//! on a majority; followers learn the commit index from the leader.

use crate::catalog::{CatalogState, Checkpoint, LogStorage, Mutation};
use crate::common::raft::{
    AppendRequest, AppendResponse, HardState, LogEntry, VoteRequest, VoteResponse,
};
use crate::common::config::MAX_ELECTION_BACKOFF;
use crate::common::{jittered, Error, MetricsRegistry, ReplicationConfig, Result};
use crate::replication::transport::ReplicaTransport;
use crate::replication::{LeaderStatus, ReplicatedLog};
use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

struct RaftState {
    role: RaftRole,
    term: u64,
    voted_for: Option<String>,
    leader_id: Option<String>,
    /// `log[i]` holds index `i + 1`
    log: Vec<LogEntry>,
    commit_index: u64,
    catalog: Arc<CatalogState>,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    election_deadline: Instant,
    failed_elections: u32,
    last_quorum_contact: Instant,
    /// Wiped member that has not yet caught up with a leader
    needs_catchup: bool,
    /// Leader only: replication rounds awaiting a reply, as
    /// peer -> round -> highest index shipped
    in_flight: HashMap<String, HashMap<u64, u64>>,
    /// Leader only: highest index shipped to a peer whose reply was lost
    maybe_stored: HashMap<String, u64>,
    round: u64,
}

impl RaftState {
    fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.log.get(index as usize - 1).map(|e| e.term)
    }

    fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            voted_for: self.voted_for.clone(),
            needs_catchup: self.needs_catchup,
        }
    }

    /// Whether `peer` may have stored `index`, acknowledged or not.
    fn peer_may_hold(&self, peer: &str, index: u64) -> bool {
        self.match_index.get(peer).copied().unwrap_or(0) >= index
            || self.maybe_stored.get(peer).copied().unwrap_or(0) >= index
            || self
                .in_flight
                .get(peer)
                .is_some_and(|rounds| rounds.values().any(|upto| *upto >= index))
    }
}

/// One member of the config replica set.
pub struct ReplicaNode {
    id: String,
    peers: Vec<String>,
    cluster_size: usize,
    config: ReplicationConfig,
    transport: Arc<dyn ReplicaTransport>,
    storage: Arc<dyn LogStorage>,
    metrics: Arc<MetricsRegistry>,
    state: Mutex<RaftState>,
    applied: watch::Sender<u64>,
    shutdown: CancellationToken,
}

impl ReplicaNode {
    /// Start a member from its durable state: the hard state, the log and
    /// the catalog checkpoint are replayed; the member starts as follower
    /// and never needs a quorum to come up.
    pub fn recover(
        id: impl Into<String>,
        members: &[String],
        config: ReplicationConfig,
        transport: Arc<dyn ReplicaTransport>,
        storage: Arc<dyn LogStorage>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Arc<Self>> {
        let id = id.into();
        if !members.contains(&id) {
            return Err(Error::UnknownMember(id));
        }
        let durable = storage.load()?;
        let checkpoint = durable.checkpoint.unwrap_or_default();
        let log_len = durable.entries.len() as u64;
        if checkpoint.applied_index > log_len {
            return Err(Error::Corrupted(format!(
                "checkpoint at index {} beyond log end {}",
                checkpoint.applied_index, log_len
            )));
        }

        info!(
            member = %id,
            term = durable.hard_state.term,
            needs_catchup = durable.hard_state.needs_catchup,
            log_entries = log_len,
            applied_index = checkpoint.applied_index,
            "replayed durable log"
        );

        let peers: Vec<String> = members.iter().filter(|m| **m != id).cloned().collect();
        let now = Instant::now();
        let state = RaftState {
            role: RaftRole::Follower,
            term: durable.hard_state.term,
            voted_for: durable.hard_state.voted_for,
            leader_id: None,
            log: durable.entries,
            commit_index: checkpoint.applied_index,
            catalog: Arc::new(checkpoint.catalog),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline: now + jittered(config.election_timeout()),
            failed_elections: 0,
            last_quorum_contact: now,
            needs_catchup: durable.hard_state.needs_catchup,
            in_flight: HashMap::new(),
            maybe_stored: HashMap::new(),
            round: 0,
        };
        let (applied, _) = watch::channel(checkpoint.applied_index);

        Ok(Arc::new(Self {
            id,
            cluster_size: peers.len() + 1,
            peers,
            config,
            transport,
            storage,
            metrics,
            state: Mutex::new(state),
            applied,
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn majority(&self) -> usize {
        self.cluster_size / 2 + 1
    }

    pub fn role(&self) -> RaftRole {
        self.state.lock().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == RaftRole::Leader
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    pub fn leader_hint(&self) -> Option<String> {
        self.state.lock().leader_id.clone()
    }

    pub fn commit_index(&self) -> u64 {
        self.state.lock().commit_index
    }

    pub fn last_log_index(&self) -> u64 {
        self.state.lock().last_log_index()
    }

    /// True while a wiped member waits to catch up; it neither votes nor
    /// campaigns until then.
    pub fn is_catching_up(&self) -> bool {
        self.state.lock().needs_catchup
    }

    /// True once this leader has committed an entry of its own term.
    pub fn has_committed_in_term(&self) -> bool {
        let st = self.state.lock();
        st.role == RaftRole::Leader && st.term_at(st.commit_index) == Some(st.term)
    }

    /// Catalog as applied locally; may lag the leader on a follower.
    pub fn local_catalog(&self) -> Arc<CatalogState> {
        self.state.lock().catalog.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until the local applied index reaches `index`.
    pub async fn wait_applied(&self, index: u64) {
        let mut rx = self.applied.subscribe();
        // Sender lives as long as self, so the only exit is reaching the index.
        let _ = rx.wait_for(|applied| *applied >= index).await;
    }

    pub fn status(&self) -> LeaderStatus {
        let st = self.state.lock();
        LeaderStatus {
            member: self.id.clone(),
            role: st.role,
            term: st.term,
            leader: st.leader_id.clone(),
            commit_index: st.commit_index,
            last_log_index: st.last_log_index(),
        }
    }

    fn persist_hard_state(&self, st: &RaftState) -> Result<()> {
        self.storage.save_hard_state(&st.hard_state())
    }

    fn election_timeout_for(&self, failed_elections: u32) -> std::time::Duration {
        let backoff = failed_elections
            .min(self.config.max_election_backoff)
            .min(MAX_ELECTION_BACKOFF);
        jittered(self.config.election_timeout() * (1u32 << backoff))
    }

    fn become_follower(&self, st: &mut RaftState, term: u64, leader: Option<String>) -> Result<()> {
        if term > st.term {
            st.term = term;
            st.voted_for = None;
            self.persist_hard_state(st)?;
        }
        if st.role == RaftRole::Leader {
            info!(member = %self.id, term, "stepping down");
        }
        st.role = RaftRole::Follower;
        st.leader_id = leader;
        Ok(())
    }

    /// Apply entries up to `new_commit` and checkpoint the catalog.
    fn apply_committed(&self, st: &mut RaftState, new_commit: u64) -> Result<()> {
        let new_commit = new_commit.min(st.last_log_index());
        if new_commit <= st.commit_index {
            return Ok(());
        }
        let from = st.commit_index + 1;
        let catalog = Arc::make_mut(&mut st.catalog);
        for index in from..=new_commit {
            let entry = &st.log[index as usize - 1];
            let changed = catalog.apply(index, &entry.mutation);
            debug!(
                member = %self.id,
                index,
                kind = entry.mutation.kind(),
                changed,
                "applied entry"
            );
        }
        st.commit_index = new_commit;
        self.storage.save_checkpoint(&Checkpoint {
            applied_index: new_commit,
            catalog: (*st.catalog).clone(),
        })?;
        self.applied.send_replace(new_commit);
        Ok(())
    }

    /// Handle a RequestVote RPC.
    pub fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        let mut st = self.state.lock();
        if req.term < st.term {
            return Ok(VoteResponse {
                term: st.term,
                vote_granted: false,
            });
        }
        if req.term > st.term {
            self.become_follower(&mut st, req.term, None)?;
        }

        let up_to_date =
            (req.last_log_term, req.last_log_index) >= (st.last_log_term(), st.last_log_index());
        let can_vote = match &st.voted_for {
            None => true,
            Some(candidate) => *candidate == req.candidate_id,
        };

        let vote_granted = up_to_date && can_vote && !st.needs_catchup;
        if vote_granted {
            st.voted_for = Some(req.candidate_id.clone());
            self.persist_hard_state(&st)?;
            st.election_deadline = Instant::now() + self.election_timeout_for(0);
        }
        debug!(
            member = %self.id,
            candidate = %req.candidate_id,
            term = req.term,
            vote_granted,
            up_to_date,
            catching_up = st.needs_catchup,
            "handled vote request"
        );
        Ok(VoteResponse {
            term: st.term,
            vote_granted,
        })
    }

    /// Handle an AppendEntries RPC (heartbeat and catch-up replication).
    pub fn handle_append_entries(&self, req: AppendRequest) -> Result<AppendResponse> {
        let mut st = self.state.lock();
        if req.term < st.term {
            return Ok(AppendResponse {
                term: st.term,
                success: false,
                conflict_index: 0,
                last_log_index: st.last_log_index(),
            });
        }
        if req.term > st.term || st.role != RaftRole::Follower {
            self.become_follower(&mut st, req.term, Some(req.leader_id.clone()))?;
        }
        st.leader_id = Some(req.leader_id.clone());
        st.failed_elections = 0;
        st.election_deadline = Instant::now() + self.election_timeout_for(0);

        if req.prev_log_index > st.last_log_index() {
            return Ok(AppendResponse {
                term: st.term,
                success: false,
                conflict_index: st.last_log_index() + 1,
                last_log_index: st.last_log_index(),
            });
        }
        let local_prev_term = st.term_at(req.prev_log_index);
        if local_prev_term != Some(req.prev_log_term) {
            let mut first = req.prev_log_index;
            while first > 1 && st.term_at(first - 1) == local_prev_term {
                first -= 1;
            }
            return Ok(AppendResponse {
                term: st.term,
                success: false,
                conflict_index: first.max(1),
                last_log_index: st.last_log_index(),
            });
        }

        let covered = req.prev_log_index + req.entries.len() as u64;
        let mut fresh = Vec::new();
        for entry in req.entries {
            if entry.index <= st.last_log_index() {
                if st.term_at(entry.index) == Some(entry.term) {
                    continue;
                }
                if entry.index <= st.commit_index {
                    return Err(Error::Internal(format!(
                        "leader {} conflicts with committed index {}",
                        req.leader_id, entry.index
                    )));
                }
                st.log.truncate(entry.index as usize - 1);
                self.storage.truncate_from(entry.index)?;
            }
            fresh.push(entry);
        }
        if !fresh.is_empty() {
            self.storage.append(&fresh)?;
            st.log.extend(fresh);
        }

        if req.leader_commit > st.commit_index {
            self.apply_committed(&mut st, req.leader_commit.min(covered))?;
        }
        // Caught up once the leader's commit index is reached and points at
        // an entry of its term: everything committed before is included.
        if st.needs_catchup
            && st.commit_index >= req.leader_commit
            && st.term_at(st.commit_index) == Some(req.term)
        {
            st.needs_catchup = false;
            st.voted_for = Some(req.leader_id.clone());
            self.persist_hard_state(&st)?;
            info!(
                member = %self.id,
                leader = %req.leader_id,
                commit_index = st.commit_index,
                "caught up after wipe"
            );
        }

        Ok(AppendResponse {
            term: st.term,
            success: true,
            conflict_index: 0,
            last_log_index: st.last_log_index(),
        })
    }

    /// Run an election immediately. Returns whether this member won.
    pub async fn campaign(&self) -> Result<bool> {
        let (term, req) = {
            let mut st = self.state.lock();
            if st.role == RaftRole::Leader {
                return Ok(true);
            }
            if st.needs_catchup {
                st.election_deadline = Instant::now() + self.election_timeout_for(0);
                debug!(member = %self.id, "not campaigning until caught up");
                return Ok(false);
            }
            st.term += 1;
            st.role = RaftRole::Candidate;
            st.voted_for = Some(self.id.clone());
            st.leader_id = None;
            self.persist_hard_state(&st)?;
            st.election_deadline = Instant::now() + self.election_timeout_for(st.failed_elections);
            let req = VoteRequest {
                term: st.term,
                candidate_id: self.id.clone(),
                last_log_index: st.last_log_index(),
                last_log_term: st.last_log_term(),
            };
            (st.term, req)
        };
        self.metrics.elections_started.inc();
        info!(member = %self.id, term, "starting election");

        let rpc_timeout = self.config.rpc_timeout();
        let responses = join_all(self.peers.iter().map(|peer| {
            let req = req.clone();
            async move {
                let res = tokio::time::timeout(rpc_timeout, self.transport.request_vote(peer, req))
                    .await
                    .map_err(Error::from)
                    .and_then(|r| r);
                (peer, res)
            }
        }))
        .await;

        let mut granted = 1;
        let mut highest_term = term;
        for (peer, res) in responses {
            match res {
                Ok(resp) => {
                    highest_term = highest_term.max(resp.term);
                    if resp.vote_granted {
                        granted += 1;
                    }
                }
                Err(e) => debug!(member = %self.id, peer = %peer, error = %e, "vote request failed"),
            }
        }

        if !self.conclude_election(term, highest_term, granted)? {
            return Ok(false);
        }

        self.metrics.elections_won.inc();
        info!(member = %self.id, term, votes = granted, "elected leader");
        self.replicate_once().await?;
        Ok(true)
    }

    fn conclude_election(&self, term: u64, highest_term: u64, granted: usize) -> Result<bool> {
        let mut st = self.state.lock();
        if highest_term > st.term {
            self.become_follower(&mut st, highest_term, None)?;
            return Ok(false);
        }
        if st.term != term || st.role != RaftRole::Candidate {
            return Ok(false);
        }

        if granted < self.majority() {
            st.failed_elections = (st.failed_elections + 1).min(self.config.max_election_backoff);
            st.election_deadline = Instant::now() + self.election_timeout_for(st.failed_elections);
            warn!(
                member = %self.id,
                term,
                votes = granted,
                needed = self.majority(),
                "election failed, backing off"
            );
            return Ok(false);
        }

        st.role = RaftRole::Leader;
        st.leader_id = Some(self.id.clone());
        st.failed_elections = 0;
        st.last_quorum_contact = Instant::now();
        let next = st.last_log_index() + 1;
        st.next_index = self.peers.iter().map(|p| (p.clone(), next)).collect();
        st.match_index = self.peers.iter().map(|p| (p.clone(), 0)).collect();
        st.in_flight.clear();
        st.maybe_stored.clear();
        let noop = LogEntry {
            term,
            index: next,
            mutation: Mutation::Noop,
        };
        self.storage.append(std::slice::from_ref(&noop))?;
        st.log.push(noop);
        Ok(true)
    }

    /// One AppendEntries round to every peer. Returns the number of members
    /// (self included) that acknowledged this leader's term.
    pub async fn replicate_once(&self) -> Result<usize> {
        let (term, round, requests) = {
            let mut st = self.state.lock();
            if st.role != RaftRole::Leader {
                return Ok(0);
            }
            let requests: Vec<(String, AppendRequest)> = self
                .peers
                .iter()
                .map(|peer| {
                    let next = st
                        .next_index
                        .get(peer)
                        .copied()
                        .unwrap_or(st.last_log_index() + 1)
                        .max(1);
                    let prev = next - 1;
                    let start = prev as usize;
                    let end = (start + self.config.max_append_entries).min(st.log.len());
                    let entries = st.log.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
                    let req = AppendRequest {
                        term: st.term,
                        leader_id: self.id.clone(),
                        prev_log_index: prev,
                        prev_log_term: st.term_at(prev).unwrap_or(0),
                        entries,
                        leader_commit: st.commit_index,
                    };
                    (peer.clone(), req)
                })
                .collect();
            st.round += 1;
            let round = st.round;
            for (peer, req) in &requests {
                if let Some(last) = req.entries.last() {
                    st.in_flight
                        .entry(peer.clone())
                        .or_default()
                        .insert(round, last.index);
                }
            }
            (st.term, round, requests)
        };

        let rpc_timeout = self.config.rpc_timeout();
        let responses = join_all(requests.into_iter().map(|(peer, req)| async move {
            let prev = req.prev_log_index;
            let sent = req.entries.len() as u64;
            let res = tokio::time::timeout(rpc_timeout, self.transport.append_entries(&peer, req))
                .await
                .map_err(Error::from)
                .and_then(|r| r);
            (peer, prev, sent, res)
        }))
        .await;

        let mut st = self.state.lock();
        if st.role != RaftRole::Leader || st.term != term {
            return Ok(0);
        }
        let mut acks = 1;
        for (peer, prev, sent, res) in responses {
            if let Some(rounds) = st.in_flight.get_mut(&peer) {
                rounds.remove(&round);
            }
            let resp = match res {
                Ok(resp) => resp,
                Err(e) => {
                    // Only a transport-level refusal proves nothing was stored
                    if sent > 0 && !matches!(e, Error::Http(_)) {
                        let lost = st.maybe_stored.entry(peer.clone()).or_insert(0);
                        *lost = (*lost).max(prev + sent);
                    }
                    debug!(member = %self.id, peer = %peer, error = %e, "append failed");
                    continue;
                }
            };
            if resp.term > st.term {
                self.become_follower(&mut st, resp.term, None)?;
                return Ok(0);
            }
            acks += 1;
            if resp.success {
                let matched = prev + sent;
                let current = st.match_index.get(&peer).copied().unwrap_or(0);
                st.match_index.insert(peer.clone(), current.max(matched));
                st.next_index.insert(peer, matched + 1);
            } else {
                let resume = resp
                    .conflict_index
                    .min(resp.last_log_index + 1)
                    .min(prev)
                    .max(1);
                st.next_index.insert(peer, resume);
            }
        }
        if acks >= self.majority() {
            st.last_quorum_contact = Instant::now();
        }
        self.advance_commit(&mut st)?;
        self.metrics.commit_index.set(st.commit_index);
        Ok(acks)
    }

    fn advance_commit(&self, st: &mut RaftState) -> Result<()> {
        let mut target = None;
        for index in (st.commit_index + 1..=st.last_log_index()).rev() {
            if st.term_at(index) != Some(st.term) {
                break;
            }
            let stored = 1 + self
                .peers
                .iter()
                .filter(|p| st.match_index.get(*p).copied().unwrap_or(0) >= index)
                .count();
            if stored >= self.majority() {
                target = Some(index);
                break;
            }
        }
        match target {
            Some(index) => self.apply_committed(st, index),
            None => Ok(()),
        }
    }

    /// Timer step: leaders heartbeat, followers campaign once their
    /// election deadline passes.
    pub async fn tick(&self) -> Result<()> {
        let (role, deadline_passed, quorum_lost) = {
            let st = self.state.lock();
            (
                st.role,
                Instant::now() >= st.election_deadline,
                st.last_quorum_contact.elapsed() > self.config.max_election_timeout(),
            )
        };
        match role {
            RaftRole::Leader if quorum_lost => {
                warn!(member = %self.id, "lost contact with a majority");
                let mut st = self.state.lock();
                let term = st.term;
                self.become_follower(&mut st, term, None)?;
                st.election_deadline = Instant::now() + self.election_timeout_for(0);
            }
            RaftRole::Leader => {
                self.replicate_once().await?;
            }
            _ if deadline_passed => {
                self.campaign().await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Drive the member's timers until shut down.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let interval = node.config.heartbeat_interval();
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = node.tick().await {
                    error!(member = %node.id, error = %e, "replication step failed");
                }
            }
            debug!(member = %node.id, "member stopped");
        })
    }

    /// Stop the timers; the member no longer campaigns or leads.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut st = self.state.lock();
        st.role = RaftRole::Follower;
        st.leader_id = None;
    }

    async fn wait_committed(&self, entry: &LogEntry) -> Result<u64> {
        loop {
            self.replicate_once().await?;
            {
                let st = self.state.lock();
                let held = st.log.get(entry.index as usize - 1) == Some(entry);
                if st.commit_index >= entry.index {
                    return if held {
                        Ok(entry.index)
                    } else {
                        Err(Error::NotPrimary(st.leader_id.clone()))
                    };
                }
                if st.role != RaftRole::Leader || st.term != entry.term {
                    return Err(Error::NotPrimary(st.leader_id.clone()));
                }
                if !held {
                    return Err(Error::Timeout(format!(
                        "entry {} was discarded before replication",
                        entry.index
                    )));
                }
            }
            tokio::time::sleep(self.config.heartbeat_interval()).await;
        }
    }

    /// Remove a cancelled entry that no peer can have stored. Later entries
    /// go with it; their writers see the discard and fail retryably.
    fn discard_unreplicated(&self, entry: &LogEntry) -> Result<bool> {
        let mut st = self.state.lock();
        if st.role != RaftRole::Leader
            || st.term != entry.term
            || st.commit_index >= entry.index
            || st.log.get(entry.index as usize - 1) != Some(entry)
        {
            return Ok(false);
        }
        if self.peers.iter().any(|p| st.peer_may_hold(p, entry.index)) {
            return Ok(false);
        }
        st.log.truncate(entry.index as usize - 1);
        self.storage.truncate_from(entry.index)?;
        Ok(true)
    }

    async fn confirmed_catalog(&self, term: u64) -> Result<Arc<CatalogState>> {
        loop {
            let acks = self.replicate_once().await?;
            {
                let st = self.state.lock();
                if st.role != RaftRole::Leader || st.term != term {
                    return Err(Error::NotPrimary(st.leader_id.clone()));
                }
                if acks >= self.majority() && st.term_at(st.commit_index) == Some(term) {
                    return Ok(st.catalog.clone());
                }
            }
            tokio::time::sleep(self.config.heartbeat_interval()).await;
        }
    }
}

#[async_trait]
impl ReplicatedLog for ReplicaNode {
    async fn append(&self, mutation: Mutation, cancel: &CancellationToken) -> Result<u64> {
        let entry = {
            let mut st = self.state.lock();
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if st.role != RaftRole::Leader {
                return Err(Error::NotPrimary(st.leader_id.clone()));
            }
            let entry = LogEntry {
                term: st.term,
                index: st.last_log_index() + 1,
                mutation,
            };
            self.storage.append(std::slice::from_ref(&entry))?;
            st.log.push(entry.clone());
            entry
        };
        let index = entry.index;
        debug!(member = %self.id, index, term = entry.term, "admitted entry");

        let deadline = tokio::time::Instant::now() + self.config.write_timeout();
        let timed_out = || Error::Timeout(format!("majority did not acknowledge index {}", index));
        tokio::select! {
            res = tokio::time::timeout_at(deadline, self.wait_committed(&entry)) => {
                return res.map_err(|_| timed_out())?;
            }
            _ = cancel.cancelled() => {}
        }

        if self.discard_unreplicated(&entry)? {
            info!(member = %self.id, index, "discarded cancelled entry");
            return Err(Error::Cancelled);
        }
        // A peer may hold the entry, so it can still commit: report what
        // actually happens to it.
        debug!(member = %self.id, index, "cancelled entry already shipped, awaiting outcome");
        tokio::time::timeout_at(deadline, self.wait_committed(&entry))
            .await
            .map_err(|_| timed_out())?
    }

    async fn read(&self) -> Result<Arc<CatalogState>> {
        let term = {
            let st = self.state.lock();
            if st.role != RaftRole::Leader {
                return Err(Error::NotPrimary(st.leader_id.clone()));
            }
            st.term
        };
        tokio::time::timeout(self.config.write_timeout(), self.confirmed_catalog(term))
            .await
            .map_err(|_| Error::Timeout("could not confirm leadership with a majority".into()))?
    }

    fn leader_status(&self) -> LeaderStatus {
        self.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemLogStorage;
    use crate::replication::LocalTransport;

    fn members(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("cfg-{}", i)).collect()
    }

    fn spawn_members(
        n: usize,
    ) -> (Arc<LocalTransport>, Vec<Arc<ReplicaNode>>, Vec<Arc<MemLogStorage>>) {
        let transport = Arc::new(LocalTransport::new());
        let ids = members(n);
        let mut nodes = Vec::new();
        let mut storages = Vec::new();
        for id in &ids {
            let storage = Arc::new(MemLogStorage::new());
            let node = ReplicaNode::recover(
                id.clone(),
                &ids,
                ReplicationConfig::local(),
                transport.clone(),
                storage.clone(),
                Arc::new(MetricsRegistry::new()),
            )
            .unwrap();
            transport.attach(node.clone());
            nodes.push(node);
            storages.push(storage);
        }
        (transport, nodes, storages)
    }

    fn add_shard(target: &str) -> Mutation {
        Mutation::AddShard {
            connection_target: target.to_string(),
            catalog_shard: false,
        }
    }

    #[tokio::test]
    async fn test_single_member_commits_alone() {
        let (_t, nodes, _s) = spawn_members(1);
        assert!(nodes[0].campaign().await.unwrap());
        let index = nodes[0]
            .append(add_shard("rs1/a:1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(index, 2);
        assert_eq!(nodes[0].commit_index(), 2);
        assert_eq!(nodes[0].read().await.unwrap().shards.len(), 1);
    }

    #[tokio::test]
    async fn test_write_replicates_to_majority() {
        let (_t, nodes, _s) = spawn_members(3);
        assert!(nodes[0].campaign().await.unwrap());
        assert!(nodes[0].is_leader());

        let index = nodes[0]
            .append(add_shard("rs1/a:1"), &CancellationToken::new())
            .await
            .unwrap();
        nodes[0].replicate_once().await.unwrap();
        for node in &nodes {
            assert!(node.last_log_index() >= index);
            assert_eq!(node.commit_index(), index);
            assert_eq!(node.local_catalog().shards.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_follower_rejects_writes() {
        let (_t, nodes, _s) = spawn_members(3);
        assert!(nodes[0].campaign().await.unwrap());
        let err = nodes[1]
            .append(add_shard("rs1/a:1"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotPrimary(Some(ref l)) if l == "cfg-1"));
        assert!(matches!(nodes[1].read().await, Err(Error::NotPrimary(_))));
    }

    #[tokio::test]
    async fn test_lagging_member_cannot_win() {
        let (transport, nodes, _s) = spawn_members(3);
        assert!(nodes[0].campaign().await.unwrap());
        transport.isolate("cfg-3");
        nodes[0]
            .append(add_shard("rs1/a:1"), &CancellationToken::new())
            .await
            .unwrap();
        transport.heal("cfg-3");

        // cfg-3 missed the write; cfg-1 and cfg-2 refuse to vote for it.
        assert!(!nodes[2].campaign().await.unwrap());
        assert!(!nodes[2].is_leader());
    }

    #[tokio::test]
    async fn test_minority_cannot_commit() {
        let (transport, nodes, _s) = spawn_members(3);
        assert!(nodes[0].campaign().await.unwrap());
        transport.isolate("cfg-2");
        transport.isolate("cfg-3");
        let err = nodes[0]
            .append(add_shard("rs1/a:1"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(nodes[0].local_catalog().shards.len(), 0);
    }

    #[tokio::test]
    async fn test_wiped_member_cannot_hand_election_to_lagging_member() {
        let (transport, nodes, storages) = spawn_members(3);
        let ids = members(3);
        assert!(nodes[0].campaign().await.unwrap());
        transport.isolate("cfg-3");
        nodes[0]
            .append(add_shard("rs1/w:1"), &CancellationToken::new())
            .await
            .unwrap();

        // cfg-2 acknowledged the write, then restarts with its data wiped
        nodes[1].shutdown();
        storages[1].clear().unwrap();
        let wiped = ReplicaNode::recover(
            "cfg-2",
            &ids,
            ReplicationConfig::local(),
            transport.clone(),
            storages[1].clone(),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        transport.attach(wiped.clone());
        assert!(wiped.is_catching_up());

        transport.isolate("cfg-1");
        transport.heal("cfg-3");
        assert!(!nodes[2].campaign().await.unwrap());
        assert!(!wiped.campaign().await.unwrap());

        // The member holding the write learns the newer term, wins it back
        // and catches cfg-2 up
        transport.heal("cfg-1");
        nodes[0].replicate_once().await.unwrap();
        assert!(!nodes[0].is_leader());
        assert!(nodes[0].campaign().await.unwrap());
        for _ in 0..5 {
            nodes[0].replicate_once().await.unwrap();
        }
        assert_eq!(nodes[0].read().await.unwrap().shards.len(), 1);
        assert_eq!(wiped.local_catalog().shards.len(), 1);
        assert!(!wiped.is_catching_up());
        assert!(storages[1].load().unwrap().hard_state.voted_for.is_some());
    }

    #[tokio::test]
    async fn test_cancel_discards_unreplicated_entry() {
        let (transport, nodes, _s) = spawn_members(3);
        assert!(nodes[0].campaign().await.unwrap());
        let before = nodes[0].last_log_index();
        transport.isolate("cfg-2");
        transport.isolate("cfg-3");

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = nodes[0].append(add_shard("rs1/a:1"), &token).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(nodes[0].last_log_index(), before);

        transport.heal("cfg-2");
        transport.heal("cfg-3");
        for _ in 0..3 {
            nodes[0].replicate_once().await.unwrap();
        }
        for node in &nodes {
            assert_eq!(node.local_catalog().shards.len(), 0);
        }

        // The freed slot is reused by the next write
        let index = nodes[0]
            .append(add_shard("rs1/b:1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(index, before + 1);
        assert_eq!(nodes[0].read().await.unwrap().shards.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_after_shipping_reports_real_outcome() {
        let (transport, nodes, _s) = spawn_members(5);
        assert!(nodes[0].campaign().await.unwrap());
        for id in ["cfg-3", "cfg-4", "cfg-5"] {
            transport.isolate(id);
        }

        let token = CancellationToken::new();
        let canceller = token.clone();
        let healer = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            healer.heal("cfg-3");
        });
        // cfg-2 stored the entry before the cancel, so it commits anyway
        let index = nodes[0].append(add_shard("rs1/a:1"), &token).await.unwrap();
        assert!(nodes[0].commit_index() >= index);
        assert_eq!(nodes[0].read().await.unwrap().shards.len(), 1);
    }

    #[test]
    fn test_election_backoff_is_bounded() {
        let config = ReplicationConfig {
            max_election_backoff: 40,
            ..ReplicationConfig::local()
        };
        let node = ReplicaNode::recover(
            "cfg-1",
            &members(1),
            config.clone(),
            Arc::new(LocalTransport::new()),
            Arc::new(MemLogStorage::new()),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        let timeout = node.election_timeout_for(u32::MAX);
        assert!(timeout < config.election_timeout() * (2u32 << MAX_ELECTION_BACKOFF));
    }

    #[tokio::test]
    async fn test_cancelled_before_admission_has_no_effect() {
        let (_t, nodes, _s) = spawn_members(1);
        assert!(nodes[0].campaign().await.unwrap());
        let token = CancellationToken::new();
        token.cancel();
        let before = nodes[0].last_log_index();
        let err = nodes[0].append(add_shard("rs1/a:1"), &token).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(nodes[0].last_log_index(), before);
    }

    #[tokio::test]
    async fn test_recover_replays_checkpoint() {
        let (transport, nodes, storages) = spawn_members(1);
        assert!(nodes[0].campaign().await.unwrap());
        nodes[0]
            .append(add_shard("rs1/a:1"), &CancellationToken::new())
            .await
            .unwrap();
        let term = nodes[0].term();
        nodes[0].shutdown();

        let revived = ReplicaNode::recover(
            "cfg-1",
            &members(1),
            ReplicationConfig::local(),
            transport,
            storages[0].clone(),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        assert_eq!(revived.term(), term);
        assert_eq!(revived.commit_index(), 2);
        assert_eq!(revived.local_catalog().shards.len(), 1);
        assert_eq!(revived.role(), RaftRole::Follower);
    }

    #[tokio::test]
    async fn test_corrupted_checkpoint_refuses_to_start() {
        let (transport, nodes, storages) = spawn_members(1);
        assert!(nodes[0].campaign().await.unwrap());
        storages[0].corrupt_checkpoint();
        let res = ReplicaNode::recover(
            "cfg-1",
            &members(1),
            ReplicationConfig::local(),
            transport,
            storages[0].clone(),
            Arc::new(MetricsRegistry::new()),
        );
        assert!(matches!(res, Err(Error::Corrupted(_))));
    }
}

//! Transports carrying Raft RPCs between config replica members

use crate::common::raft::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
use crate::common::{Error, MemberSpec, Result};
use crate::replication::node::ReplicaNode;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    async fn request_vote(&self, target: &str, req: VoteRequest) -> Result<VoteResponse>;

    /// `Err(Error::Http)` means the target never received the request; any
    /// other error leaves open whether it stored the entries.
    async fn append_entries(&self, target: &str, req: AppendRequest) -> Result<AppendResponse>;

    /// Called when a member starts in this process.
    fn attach(&self, _node: Arc<ReplicaNode>) {}

    /// Called when a local member shuts down.
    fn detach(&self, _member: &str) {}
}

/// In-process transport: members of one replica set sharing a process.
///
/// Members can be isolated to simulate crashes and partitions; messages to
/// or from an isolated member fail as if the host were unreachable.
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<String, Arc<ReplicaNode>>>,
    isolated: RwLock<HashSet<String>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolate(&self, member: &str) {
        self.isolated.write().insert(member.to_string());
    }

    pub fn heal(&self, member: &str) {
        self.isolated.write().remove(member);
    }

    fn route(&self, from: &str, target: &str) -> Result<Arc<ReplicaNode>> {
        {
            let isolated = self.isolated.read();
            if isolated.contains(from) || isolated.contains(target) {
                return Err(Error::Http(format!("{} unreachable from {}", target, from)));
            }
        }
        self.nodes
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| Error::Http(format!("{} is not running", target)))
    }
}

#[async_trait]
impl ReplicaTransport for LocalTransport {
    async fn request_vote(&self, target: &str, req: VoteRequest) -> Result<VoteResponse> {
        let node = self.route(&req.candidate_id, target)?;
        tokio::task::yield_now().await;
        node.handle_request_vote(req)
    }

    async fn append_entries(&self, target: &str, req: AppendRequest) -> Result<AppendResponse> {
        let node = self.route(&req.leader_id, target)?;
        tokio::task::yield_now().await;
        node.handle_append_entries(req)
    }

    fn attach(&self, node: Arc<ReplicaNode>) {
        self.nodes.write().insert(node.id().to_string(), node);
    }

    fn detach(&self, member: &str) {
        self.nodes.write().remove(member);
    }
}

/// JSON over HTTP to the `/raft/*` endpoints of the other members.
pub struct HttpTransport {
    client: reqwest::Client,
    urls: HashMap<String, String>,
}

impl HttpTransport {
    pub fn new(members: &[MemberSpec], rpc_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("HTTP client: {}", e)))?;
        let urls = members
            .iter()
            .map(|m| (m.id.clone(), m.url.clone()))
            .collect();
        Ok(Self { client, urls })
    }

    fn url(&self, target: &str, path: &str) -> Result<String> {
        self.urls
            .get(target)
            .map(|base| format!("{}{}", base, path))
            .ok_or_else(|| Error::UnknownMember(target.to_string()))
    }
}

#[async_trait]
impl ReplicaTransport for HttpTransport {
    async fn request_vote(&self, target: &str, req: VoteRequest) -> Result<VoteResponse> {
        let resp = self
            .client
            .post(self.url(target, "/raft/vote")?)
            .json(&req)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn append_entries(&self, target: &str, req: AppendRequest) -> Result<AppendResponse> {
        let resp = self
            .client
            .post(self.url(target, "/raft/append")?)
            .json(&req)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| append_failure(target, e))?;
        resp.json().await.map_err(|e| append_failure(target, e))
    }
}

/// Only a failed connect proves the request never arrived; anything later
/// may have been handled by the target.
fn append_failure(target: &str, e: reqwest::Error) -> Error {
    if e.is_connect() {
        Error::Http(format!("{} unreachable: {}", target, e))
    } else {
        Error::Timeout(format!("{} did not answer append: {}", target, e))
    }
}

//! Raft messages exchanged between config replica members

use crate::catalog::Mutation;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// On rejection, the index the leader should resume from
    pub conflict_index: u64,
    /// Last index stored by the follower after handling the request
    pub last_log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub mutation: Mutation,
}

/// Term and vote, persisted before either is acted on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<String>,
    /// Set when the member's data was wiped; it may not vote or campaign
    /// until it has caught up with a leader's commit index
    #[serde(default)]
    pub needs_catchup: bool,
}

impl HardState {
    pub fn wiped() -> Self {
        Self {
            needs_catchup: true,
            ..Self::default()
        }
    }
}

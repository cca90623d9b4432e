//! The narrow surface the cluster layer needs from a consensus engine.
//!
//! Anything that can order entries, report its role and leader, add voters
//! and publish leadership transitions can back a [`crate::coordinator::ClusterCoordinator`].
//! [`crate::raft_engine::RaftEngine`] is the implementation shipped with this crate.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
    Candidate,
}

impl From<raft::StateRole> for Role {
    fn from(role: raft::StateRole) -> Self {
        match role {
            raft::StateRole::Leader => Role::Leader,
            raft::StateRole::Follower => Role::Follower,
            raft::StateRole::Candidate | raft::StateRole::PreCandidate => Role::Candidate,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
            Role::Candidate => "candidate",
        };
        f.write_str(name)
    }
}

/// Outcome of a committed entry on the node that proposed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub index: u64,
    pub term: u64,
    /// Result of applying the entry to the local state machine.
    pub applied: Result<()>,
}

/// A cluster member as the replicated configuration records it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    /// Replication address, the member's identity.
    pub raft_addr: String,
    /// Service address writes and joins are forwarded to.
    pub http_addr: String,
}

#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    /// Proposes `entry` and waits until it is committed and applied locally,
    /// or `timeout` elapses.
    async fn submit(&self, entry: Vec<u8>, timeout: Duration) -> Result<Commit>;

    /// Role of this node right now. Never cache this across a decision.
    fn role(&self) -> Role;

    /// Identity (replication address) of the current leader, if known.
    fn leader(&self) -> Option<String>;

    /// Adds `id` (a replication address) as a voting member. `address` is
    /// the service address every member learns for it.
    async fn add_voter(&self, id: &str, address: &str) -> Result<()>;

    /// Starts a brand-new cluster whose only member is this node, advertised
    /// at service address `address`.
    async fn bootstrap(&self, id: &str, address: &str) -> Result<()>;

    /// Stream of leadership transitions: `true` on becoming leader, `false`
    /// on losing it.
    fn subscribe_leadership(&self) -> broadcast::Receiver<bool>;

    /// Members learned from the replicated configuration, as they are applied
    /// on this node.
    fn subscribe_membership(&self) -> broadcast::Receiver<Member>;
}

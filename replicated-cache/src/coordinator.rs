//! Write path, join protocol and membership tracking.
//!
//! The coordinator never trusts a cached "am I leader" answer: every write and
//! join asks the engine for its role and leader at the moment it decides, since
//! leadership can move between two calls.
//!
//! The membership map starts from this node (or the view returned by a join)
//! and then follows the members the engine reports as their conf changes are
//! applied, so every node can resolve whichever member becomes leader.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::{Command, ForwardedWrite};
use crate::config::APPLY_TIMEOUT;
use crate::engine::{ConsensusEngine, Member, Role};
use crate::error::{CacheError, Result};
use crate::protocol::{routes, HttpReply, JoinRequest, JoinResult, STATUS_OK};
use crate::transport::ClusterTransport;

/// Point-in-time view of this node's place in the cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub node: String,
    pub role: String,
    pub leader: Option<String>,
    pub members: HashMap<String, String>,
}

pub struct ClusterCoordinator {
    engine: Arc<dyn ConsensusEngine>,
    transport: Arc<dyn ClusterTransport>,
    http_addr: String,
    raft_addr: String,
    apply_timeout: Duration,
    /// Raft address to service address. Never locked together with the store.
    membership: Arc<Mutex<HashMap<String, String>>>,
}

impl ClusterCoordinator {
    pub fn new(
        http_addr: impl Into<String>,
        raft_addr: impl Into<String>,
        engine: Arc<dyn ConsensusEngine>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Self {
        let http_addr = http_addr.into();
        let raft_addr = raft_addr.into();
        let membership = HashMap::from([(raft_addr.clone(), http_addr.clone())]);
        Self {
            engine,
            transport,
            http_addr,
            raft_addr,
            apply_timeout: APPLY_TIMEOUT,
            membership: Arc::new(Mutex::new(membership)),
        }
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    pub fn http_addr(&self) -> &str {
        &self.http_addr
    }

    pub fn raft_addr(&self) -> &str {
        &self.raft_addr
    }

    /// Joins the cluster behind `join_addr`, or bootstraps a single-member
    /// cluster when there is nothing to join.
    pub async fn start(&self, join_addr: Option<&str>) -> Result<()> {
        match join_addr {
            Some(addr) => self.join_cluster(addr).await,
            None => {
                self.engine.bootstrap(&self.raft_addr, &self.http_addr).await?;
                info!(raft = %self.raft_addr, http = %self.http_addr, "bootstrapped single-member cluster");
                Ok(())
            }
        }
    }

    /// Follows the engine for its lifetime: logs leadership transitions and
    /// records members as the engine learns them.
    pub fn spawn_cluster_watch(&self) -> JoinHandle<()> {
        let mut transitions = self.engine.subscribe_leadership();
        let mut members = self.engine.subscribe_membership();
        let membership = self.membership.clone();
        let node = self.raft_addr.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    transition = transitions.recv() => match transition {
                        Ok(true) => info!(node = %node, "became leader"),
                        Ok(false) => info!(node = %node, "became follower"),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(node = %node, skipped, "missed leadership notifications")
                        }
                        Err(RecvError::Closed) => break,
                    },
                    member = members.recv() => match member {
                        Ok(member) => record_member(&membership, member),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(node = %node, skipped, "missed membership updates")
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!(node = %node, "engine streams closed");
        })
    }

    /// Replicates `cmd`, submitting locally when leader and forwarding to
    /// `uri` on the leader otherwise.
    ///
    /// Nothing is retried or deduplicated here. A `SubmitTimeout` or
    /// `LeadershipLost` means the outcome is unknown.
    pub async fn apply(&self, uri: &str, cmd: Command) -> Result<()> {
        let entry = cmd.encode()?;

        if self.engine.role() == Role::Leader {
            let commit = self
                .engine
                .submit(entry, self.apply_timeout)
                .await
                .inspect_err(|err| error!(error = %err, "apply failed"))?;
            debug!(index = commit.index, term = commit.term, "entry committed");
            return commit.applied;
        }

        let leader = self.leader_http_addr().ok_or(CacheError::NoLeader)?;
        let body = serde_json::to_vec(&ForwardedWrite::from(&cmd))?;
        debug!(leader = %leader, uri, "forwarding write to leader");
        let reply = self.transport.post(&leader, uri, body).await?;
        let reply: HttpReply = serde_json::from_slice(&reply)?;
        if reply.retcode != STATUS_OK {
            return Err(CacheError::Remote {
                code: reply.retcode,
                desc: reply.retdesc,
            });
        }
        Ok(())
    }

    /// Handles a join request from a node that wants to become a voter.
    pub async fn join_handler(&self, req: JoinRequest) -> JoinResult {
        if self.engine.role() == Role::Leader {
            if let Err(err) = self.engine.add_voter(&req.raft_addr, &req.http_addr).await {
                error!(error = %err, raft = %req.raft_addr, "join cluster failed");
                return JoinResult::error(&err);
            }

            let mut membership = self.membership.lock();
            membership.insert(req.raft_addr.clone(), req.http_addr.clone());
            info!(raft = %req.raft_addr, http = %req.http_addr, members = membership.len(), "node joined");
            return JoinResult::ok(membership.clone());
        }

        let Some(leader) = self.leader_http_addr() else {
            return JoinResult::error(&CacheError::NoLeader);
        };

        match self.forward_join(&leader, &req).await {
            Ok(result) => result,
            Err(CacheError::Remote { code, desc }) => JoinResult {
                retcode: code,
                retdesc: desc,
                datas: HashMap::new(),
            },
            Err(err) => JoinResult::error(&err),
        }
    }

    async fn forward_join(&self, leader: &str, req: &JoinRequest) -> Result<JoinResult> {
        let body = serde_json::to_vec(req)?;
        debug!(leader = %leader, raft = %req.raft_addr, "forwarding join to leader");
        let reply = self.transport.post(leader, routes::JOIN, body).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Asks the member at `join_addr` to add this node, then adopts the
    /// membership it returns.
    pub async fn join_cluster(&self, join_addr: &str) -> Result<()> {
        let req = JoinRequest {
            http_addr: self.http_addr.clone(),
            raft_addr: self.raft_addr.clone(),
        };
        let body = serde_json::to_vec(&req)?;

        let reply = self
            .transport
            .post(join_addr, routes::JOIN, body)
            .await
            .map_err(|err| CacheError::JoinFailed(err.to_string()))?;
        let result: JoinResult = serde_json::from_slice(&reply)
            .map_err(|err| CacheError::JoinFailed(err.to_string()))?;
        if !result.is_ok() {
            return Err(CacheError::JoinFailed(result.retdesc));
        }

        let mut membership = self.membership.lock();
        membership.extend(result.datas);
        info!(via = %join_addr, members = membership.len(), "joined cluster");
        Ok(())
    }

    /// Service address of the current leader, if the engine knows a leader
    /// and the membership maps it. The map may lag behind a just-elected
    /// leader until its member update arrives.
    pub fn leader_http_addr(&self) -> Option<String> {
        let leader = self.engine.leader()?;
        self.membership.lock().get(&leader).cloned()
    }

    pub fn membership(&self) -> HashMap<String, String> {
        self.membership.lock().clone()
    }

    pub fn status(&self) -> ClusterStatus {
        ClusterStatus {
            node: self.raft_addr.clone(),
            role: self.engine.role().to_string(),
            leader: self.engine.leader(),
            members: self.membership(),
        }
    }
}

fn record_member(membership: &Mutex<HashMap<String, String>>, member: Member) {
    let mut membership = membership.lock();
    if membership.get(&member.raft_addr) != Some(&member.http_addr) {
        info!(raft = %member.raft_addr, http = %member.http_addr, "learned member");
        membership.insert(member.raft_addr, member.http_addr);
    }
}

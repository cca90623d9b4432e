//! [`ConsensusEngine`] backed by tikv/raft.
//!
//! # Threads
//!
//! - **Worker**: owns the [`node::RaftNode`], serves engine requests, ticks
//!   the raft clock and applies committed entries to the state machine
//! - **Listener**: accepts peer connections and forwards raft messages to the
//!   worker, one short-lived thread per connection
//! - **Send lanes**: one per peer address, delivering outbound messages
//!
//! The async side talks to the worker over a crossbeam channel and gets its
//! answers back on tokio oneshots, so no raft state is ever shared. Role,
//! leader and term are published into an [`EngineStatus`] that readers can
//! query without a round trip.
//!
//! # Identity
//!
//! A node is identified by its replication address. Raft wants a numeric id,
//! derived with [`node_id_for`]; the [`PeerBook`] maps ids back to addresses
//! and is filled from conf changes, snapshots and inbound frames. Conf changes
//! and snapshots also carry each member's service address, which is
//! published to [`ConsensusEngine::subscribe_membership`] subscribers.

mod node;
mod peer;
mod storage;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_channel::{Sender, unbounded};
use parking_lot::RwLock;
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info};

use crate::config::NodeConfig;
use crate::engine::{Commit, ConsensusEngine, Member, Role};
use crate::error::{CacheError, Result};
use crate::fsm::StateMachine;

use self::node::RaftNode;
use self::peer::Outbox;
use self::worker::{EngineRequest, Worker};

/// Raft id to replication address, shared between the worker and readers.
pub type PeerBook = Arc<RwLock<HashMap<u64, String>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub role: Role,
    /// Raft id of the known leader, 0 when there is none.
    pub leader_id: u64,
    pub term: u64,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            role: Role::Follower,
            leader_id: raft::INVALID_ID,
            term: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub raft_addr: String,
    pub tick_interval: Duration,
    pub snapshot_threshold: u64,
    /// Bound on membership and bootstrap requests.
    pub request_timeout: Duration,
}

impl From<&NodeConfig> for EngineConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            raft_addr: config.raft_addr.clone(),
            tick_interval: config.tick_interval,
            snapshot_threshold: config.snapshot_threshold,
            request_timeout: config.apply_timeout,
        }
    }
}

/// Stable non-zero raft id for a replication address (64-bit FNV-1a).
pub fn node_id_for(addr: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let hash = addr
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME));
    // 0 is raft's "no node".
    hash.max(1)
}

pub struct RaftEngine {
    id: u64,
    addr: String,
    requests: Sender<EngineRequest>,
    status: Arc<RwLock<EngineStatus>>,
    peers: PeerBook,
    leadership: broadcast::Sender<bool>,
    membership: broadcast::Sender<Member>,
    request_timeout: Duration,
}

impl RaftEngine {
    /// Binds the replication address and starts the worker. The node joins
    /// no cluster until [`ConsensusEngine::bootstrap`] is called or a leader
    /// adds it.
    pub fn spawn(config: EngineConfig, fsm: Arc<dyn StateMachine>) -> Result<Self> {
        let id = node_id_for(&config.raft_addr);
        let peers: PeerBook = Arc::new(RwLock::new(HashMap::from([(
            id,
            config.raft_addr.clone(),
        )])));
        let node = RaftNode::new(id, fsm, peers.clone(), config.snapshot_threshold)?;

        let (request_tx, request_rx) = unbounded();
        let (inbound_tx, inbound_rx) = unbounded();
        let (report_tx, report_rx) = unbounded();
        peer::spawn_listener(&config.raft_addr, inbound_tx)?;

        let status = Arc::new(RwLock::new(EngineStatus::default()));
        let (leadership, _) = broadcast::channel(16);
        let (membership, _) = broadcast::channel(64);

        let worker = Worker::new(
            node,
            peers.clone(),
            request_rx,
            inbound_rx,
            report_rx,
            Outbox::new(config.raft_addr.clone(), report_tx),
            status.clone(),
            leadership.clone(),
            membership.clone(),
            config.tick_interval,
        );
        thread::Builder::new()
            .name(format!("raft-worker-{id}"))
            .spawn(move || {
                if let Err(err) = worker.run() {
                    error!(node = id, error = %err, "raft worker crashed");
                }
            })
            .map_err(|err| CacheError::Engine(format!("failed to spawn raft worker: {err}")))?;

        info!(node = id, addr = %config.raft_addr, "raft engine started");
        Ok(Self {
            id,
            addr: config.raft_addr,
            requests: request_tx,
            status,
            peers,
            leadership,
            membership,
            request_timeout: config.request_timeout,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.read()
    }

    /// Stops the worker. Pending callers fail; the engine answers nothing
    /// afterwards.
    pub fn shutdown(&self) {
        let _ = self.requests.send(EngineRequest::Shutdown);
    }

    async fn call<T, F>(&self, timeout: Duration, build: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(oneshot::Sender<Result<T>>) -> EngineRequest + Send,
    {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .map_err(|_| CacheError::Engine("consensus engine stopped".to_string()))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CacheError::Engine("consensus engine stopped".to_string())),
            // Dropping the receiver lets the worker forget the proposal.
            Err(_) => Err(CacheError::SubmitTimeout),
        }
    }
}

impl Drop for RaftEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl ConsensusEngine for RaftEngine {
    async fn submit(&self, entry: Vec<u8>, timeout: Duration) -> Result<Commit> {
        self.call(timeout, |respond_to| EngineRequest::Submit { entry, respond_to })
            .await
    }

    fn role(&self) -> Role {
        self.status.read().role
    }

    fn leader(&self) -> Option<String> {
        let leader_id = self.status.read().leader_id;
        if leader_id == raft::INVALID_ID {
            return None;
        }
        self.peers.read().get(&leader_id).cloned()
    }

    async fn add_voter(&self, id: &str, address: &str) -> Result<()> {
        let node_id = node_id_for(id);
        let member = Member {
            raft_addr: id.to_string(),
            http_addr: address.to_string(),
        };
        self.call(self.request_timeout, |respond_to| EngineRequest::AddVoter {
            node_id,
            member,
            respond_to,
        })
        .await
    }

    async fn bootstrap(&self, id: &str, address: &str) -> Result<()> {
        if node_id_for(id) != self.id {
            return Err(CacheError::Engine(format!(
                "cannot bootstrap {id} from node at {}",
                self.addr
            )));
        }
        let http_addr = address.to_string();
        self.call(self.request_timeout, |respond_to| EngineRequest::Bootstrap {
            http_addr,
            respond_to,
        })
        .await
    }

    fn subscribe_leadership(&self) -> broadcast::Receiver<bool> {
        self.leadership.subscribe()
    }

    fn subscribe_membership(&self) -> broadcast::Receiver<Member> {
        self.membership.subscribe()
    }
}

//! Raft node bound to a cache state machine.
//!
//! [`RaftNode`] wraps tikv/raft's `RawNode` and adds what the cache needs on
//! top of plain replication:
//!
//! - committed entries are handed to a [`StateMachine`] and the outcome is
//!   reported back together with the proposal context
//! - membership grows through `AddNode` conf changes whose context carries the
//!   new member's replication and service addresses, one change at a time
//! - the log is compacted into snapshots built from the state machine, and
//!   snapshots received from the leader restore it
//!
//! The node is single-threaded; [`super::worker`] owns it and drives it.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, ConfState, Config, Entry, EntryType, Message, RawNode, Snapshot,
};
use raft::{SnapshotStatus, StateRole, Storage};
use serde::{Deserialize, Serialize};
use slog::{Logger, o};
use tracing::{debug, info, warn};

use super::PeerBook;
use super::storage::LogStore;
use crate::engine::Member;
use crate::error::{CacheError, Result};
use crate::fsm::StateMachine;
use crate::snapshot::MemorySnapshotSink;

/// The raft library insists on a slog logger; cache-level events go through
/// `tracing` instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Payload of a raft snapshot: replication and service addresses of every
/// known member plus the state machine's own snapshot bytes.
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct SnapshotFrame {
    pub(super) peers: HashMap<u64, String>,
    pub(super) services: HashMap<u64, String>,
    pub(super) state: Vec<u8>,
}

/// Outcome of applying one committed entry.
///
/// `context` is whatever the proposer attached, so the worker can match the
/// entry to a waiting caller.
pub struct ApplyReport {
    pub index: u64,
    pub term: u64,
    pub context: Vec<u8>,
    pub outcome: Result<()>,
}

/// Output of one pass over raft's ready state.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
    /// Members added by applied conf changes or an installed snapshot.
    pub members: Vec<Member>,
}

pub struct RaftNode {
    id: u64,
    config: Config,
    raw: RawNode<LogStore>,
    storage: LogStore,
    fsm: Arc<dyn StateMachine>,
    peers: PeerBook,
    /// Raft id to service address.
    services: HashMap<u64, String>,
    learned: Vec<Member>,
    conf_state: ConfState,
    applied: u64,
    snapshot_threshold: u64,
    snapshots_taken: u64,
}

impl RaftNode {
    /// Creates a node that belongs to no cluster yet. It stays passive until
    /// [`RaftNode::bootstrap`] is called or a leader adds it.
    ///
    /// Ticks are expected every 100ms: elections fire after 10 ticks without a
    /// leader and the leader heartbeats every 3.
    pub fn new(
        id: u64,
        fsm: Arc<dyn StateMachine>,
        peers: PeerBook,
        snapshot_threshold: u64,
    ) -> Result<Self> {
        let config = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            max_size_per_msg: 1024 * 1024,
            ..Default::default()
        };
        let storage = LogStore::new();
        let raw = RawNode::new(&config, storage.clone(), &silent_logger())?;
        Ok(Self {
            id,
            config,
            raw,
            storage,
            fsm,
            peers,
            services: HashMap::new(),
            learned: Vec::new(),
            conf_state: ConfState::default(),
            applied: 0,
            snapshot_threshold,
            snapshots_taken: 0,
        })
    }

    /// Turns this node into a one-voter cluster and elects it.
    /// `http_addr` is the service address recorded for this node.
    pub fn bootstrap(&mut self, http_addr: &str) -> Result<()> {
        if self.is_initialized() {
            return Err(CacheError::Engine(
                "node already belongs to a cluster".to_string(),
            ));
        }
        let storage = LogStore::with_voters(vec![self.id]);
        self.raw = RawNode::new(&self.config, storage.clone(), &silent_logger())?;
        self.storage = storage;
        self.conf_state = ConfState::from((vec![self.id], vec![]));
        self.services.insert(self.id, http_addr.to_string());
        self.raw.campaign()?;
        info!(node = self.id, "bootstrapped single-voter cluster");
        Ok(())
    }

    /// Whether this node has a configuration or has heard from a leader.
    pub fn is_initialized(&self) -> bool {
        !self.conf_state.voters.is_empty() || self.raw.raft.term > 0
    }

    pub fn tick(&mut self) {
        self.raw.tick();
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Current leader id, 0 when unknown.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn applied_index(&self) -> u64 {
        self.applied
    }

    pub fn snapshot_index(&self) -> u64 {
        self.storage.snapshot_index()
    }

    pub fn is_voter(&self, id: u64) -> bool {
        self.conf_state.voters.contains(&id)
    }

    /// Whether a proposed conf change has not been applied yet. Raft refuses
    /// a second one in the meantime.
    pub fn has_pending_conf(&self) -> bool {
        self.raw.raft.has_pending_conf()
    }

    /// Service address recorded for raft id `id`.
    pub fn service_addr(&self, id: u64) -> Option<&str> {
        self.services.get(&id).map(String::as_str)
    }

    /// Refreshes the addresses of an existing member.
    pub fn record_member(&mut self, id: u64, member: &Member) {
        self.peers.write().insert(id, member.raft_addr.clone());
        self.services.insert(id, member.http_addr.clone());
    }

    /// Appends `data` to the log. Success only means the entry was accepted
    /// by the leader; the matching [`ApplyReport`] arrives once committed.
    pub fn propose(&mut self, context: Vec<u8>, data: Vec<u8>) -> Result<()> {
        self.raw.propose(context, data)?;
        Ok(())
    }

    /// Proposes adding `node_id` as a voter. Fails while another conf change
    /// is pending.
    pub fn propose_add_voter(&mut self, context: Vec<u8>, node_id: u64, member: &Member) -> Result<()> {
        if self.has_pending_conf() {
            return Err(CacheError::Engine(
                "a membership change is already in progress".to_string(),
            ));
        }
        let mut cc = ConfChange::default();
        cc.node_id = node_id;
        cc.set_change_type(ConfChangeType::AddNode);
        cc.context = bincode::serialize(member)
            .map_err(|err| CacheError::Engine(err.to_string()))?
            .into();
        self.raw.propose_conf_change(context, cc)?;
        Ok(())
    }

    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg)?;
        Ok(())
    }

    pub fn report_unreachable(&mut self, id: u64) {
        self.raw.report_unreachable(id);
    }

    pub fn report_snapshot(&mut self, id: u64, status: SnapshotStatus) {
        self.raw.report_snapshot(id, status);
    }

    /// Processes pending raft work: persists log state, installs snapshots,
    /// applies committed entries and collects outbound messages. Returns
    /// `None` when there was nothing to do.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        self.maybe_compact()?;
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = Vec::new();

        outbound.extend(ready.take_messages());

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            self.install_snapshot(snapshot)?;
        }

        if !ready.entries().is_empty() {
            self.storage.append(ready.entries())?;
        }

        if let Some(hard_state) = ready.hs() {
            self.storage.set_hardstate(hard_state.clone());
        }

        applied.extend(self.apply_entries(ready.take_committed_entries())?);
        outbound.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.set_commit(commit);
        }

        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);
        outbound.extend(light_ready.take_messages());

        self.raw.advance_apply();

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
            members: std::mem::take(&mut self.learned),
        }))
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<ApplyReport>> {
        let mut applied = Vec::new();
        for entry in entries {
            self.applied = entry.index;
            // Leader no-ops and refused conf changes carry no data.
            if entry.data.is_empty() {
                continue;
            }
            let outcome = match entry.entry_type() {
                EntryType::EntryNormal => self.fsm.apply(&entry.data[..]),
                EntryType::EntryConfChange => self.apply_conf_change(&entry),
                EntryType::EntryConfChangeV2 => {
                    warn!(index = entry.index, "ignoring joint configuration change");
                    continue;
                }
            };
            applied.push(ApplyReport {
                index: entry.index,
                term: entry.term,
                context: entry.context.to_vec(),
                outcome,
            });
        }
        Ok(applied)
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<()> {
        let cc = ConfChange::decode(&entry.data[..])
            .map_err(|err| CacheError::Decode(err.to_string()))?;

        let cs = self.raw.apply_conf_change(&cc)?;
        self.storage.set_conf_state(cs.clone());
        self.conf_state = cs;

        if cc.change_type() != ConfChangeType::AddNode {
            return Ok(());
        }
        match bincode::deserialize::<Member>(&cc.context[..]) {
            Ok(member) => {
                info!(
                    node = self.id,
                    member = cc.node_id,
                    raft = %member.raft_addr,
                    http = %member.http_addr,
                    voters = ?self.conf_state.voters,
                    "membership changed"
                );
                self.record_member(cc.node_id, &member);
                self.learned.push(member);
            }
            Err(err) => {
                warn!(node = self.id, member = cc.node_id, error = %err, "conf change without member addresses");
            }
        }
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata().clone();
        let frame: SnapshotFrame = bincode::deserialize(&snapshot.data[..])
            .map_err(|err| CacheError::Snapshot(err.to_string()))?;

        // The store is only replaced once the log has accepted the snapshot.
        self.storage.apply_snapshot(snapshot)?;
        self.conf_state = meta.get_conf_state().clone();
        self.fsm.restore(Box::new(Cursor::new(frame.state)))?;
        self.applied = meta.index;

        for (id, http_addr) in frame.services {
            if let Some(raft_addr) = frame.peers.get(&id) {
                self.learned.push(Member {
                    raft_addr: raft_addr.clone(),
                    http_addr: http_addr.clone(),
                });
            }
            self.services.insert(id, http_addr);
        }
        self.peers.write().extend(frame.peers);

        info!(
            node = self.id,
            index = meta.index,
            term = meta.term,
            "installed snapshot from leader"
        );
        Ok(())
    }

    /// Compacts when enough entries were applied since the last snapshot or
    /// when raft needed a snapshot it could not get.
    fn maybe_compact(&mut self) -> Result<()> {
        let requested = self.storage.take_snapshot_request();
        let since_last = self.applied.saturating_sub(self.storage.snapshot_index());
        let due = self.snapshot_threshold > 0 && since_last >= self.snapshot_threshold;
        if self.applied == 0 || !(requested || due) {
            return Ok(());
        }
        self.compact()
    }

    /// Snapshots the state machine at the applied index and drops the log up
    /// to it.
    fn compact(&mut self) -> Result<()> {
        let index = self.applied;
        let term = self.storage.term(index)?;

        let carrier = self.fsm.snapshot()?;
        self.snapshots_taken += 1;
        let mut sink = MemorySnapshotSink::new(format!("{term}-{index}-{}", self.snapshots_taken));
        carrier.persist(&mut sink)?;
        carrier.release();
        let state = sink
            .into_contents()
            .ok_or_else(|| CacheError::Snapshot("snapshot sink was not closed".to_string()))?;

        let frame = SnapshotFrame {
            peers: self.peers.read().clone(),
            services: self.services.clone(),
            state,
        };
        let data = bincode::serialize(&frame).map_err(|err| CacheError::Snapshot(err.to_string()))?;

        let mut snapshot = Snapshot::default();
        snapshot.data = data.into();
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        meta.set_conf_state(self.conf_state.clone());

        self.storage.compact_to(snapshot)?;
        debug!(node = self.id, index, term, "compacted log");
        Ok(())
    }
}

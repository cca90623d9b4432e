//! The thread that owns the raft node.
//!
//! The worker waits on three sources with `crossbeam_channel::select!`:
//!
//! - **requests** from [`super::RaftEngine`] (submit, add voter, bootstrap)
//! - **inbound** raft messages from the peer listener
//! - **send reports** from the outbound lanes
//!
//! and ticks the raft clock whenever the tick interval elapses. After every
//! event it drains the node's ready state, answers callers whose entries were
//! applied and publishes role and membership changes.
//!
//! Raft takes one conf change at a time, so voter additions wait in a queue
//! until the previous one is applied.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::RwLock;
use raft::prelude::Message;
use raft::{SnapshotStatus, StateRole};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use super::node::{ApplyReport, RaftNode};
use super::peer::{Inbound, Outbox, SendReport};
use super::{EngineStatus, PeerBook};
use crate::engine::{Commit, Member, Role};
use crate::error::{CacheError, Result};

pub(crate) enum EngineRequest {
    Submit {
        entry: Vec<u8>,
        respond_to: oneshot::Sender<Result<Commit>>,
    },
    AddVoter {
        node_id: u64,
        member: Member,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Bootstrap {
        http_addr: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// A caller waiting for its proposal to be applied.
enum Pending {
    Submit(oneshot::Sender<Result<Commit>>),
    AddVoter(oneshot::Sender<Result<()>>),
}

impl Pending {
    fn is_closed(&self) -> bool {
        match self {
            Pending::Submit(tx) => tx.is_closed(),
            Pending::AddVoter(tx) => tx.is_closed(),
        }
    }

    fn fail(self, err: CacheError) {
        match self {
            Pending::Submit(tx) => {
                let _ = tx.send(Err(err));
            }
            Pending::AddVoter(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }

    fn complete(self, report: ApplyReport) {
        match self {
            Pending::Submit(tx) => {
                let _ = tx.send(Ok(Commit {
                    index: report.index,
                    term: report.term,
                    applied: report.outcome,
                }));
            }
            Pending::AddVoter(tx) => {
                let _ = tx.send(report.outcome);
            }
        }
    }
}

/// A voter addition not yet proposed.
struct QueuedVoter {
    node_id: u64,
    member: Member,
    respond_to: oneshot::Sender<Result<()>>,
}

/// Proposal context: proposing node id and a per-node sequence number, both
/// big-endian. Entries proposed elsewhere never match a local sequence.
fn proposal_context(node_id: u64, seq: u64) -> Vec<u8> {
    let mut ctx = Vec::with_capacity(16);
    ctx.extend_from_slice(&node_id.to_be_bytes());
    ctx.extend_from_slice(&seq.to_be_bytes());
    ctx
}

fn parse_context(ctx: &[u8]) -> Option<(u64, u64)> {
    if ctx.len() != 16 {
        return None;
    }
    let (node, seq) = ctx.split_at(8);
    Some((
        u64::from_be_bytes(node.try_into().ok()?),
        u64::from_be_bytes(seq.try_into().ok()?),
    ))
}

pub(crate) struct Worker {
    node: RaftNode,
    peers: PeerBook,
    requests: Receiver<EngineRequest>,
    inbound: Receiver<Inbound>,
    send_reports: Receiver<SendReport>,
    outbox: Outbox,
    status: Arc<RwLock<EngineStatus>>,
    leadership: broadcast::Sender<bool>,
    membership: broadcast::Sender<Member>,
    pending: HashMap<u64, Pending>,
    queued_voters: VecDeque<QueuedVoter>,
    next_seq: u64,
    last_role: StateRole,
    tick_interval: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node: RaftNode,
        peers: PeerBook,
        requests: Receiver<EngineRequest>,
        inbound: Receiver<Inbound>,
        send_reports: Receiver<SendReport>,
        outbox: Outbox,
        status: Arc<RwLock<EngineStatus>>,
        leadership: broadcast::Sender<bool>,
        membership: broadcast::Sender<Member>,
        tick_interval: Duration,
    ) -> Self {
        let last_role = node.role();
        Self {
            node,
            peers,
            requests,
            inbound,
            send_reports,
            outbox,
            status,
            leadership,
            membership,
            pending: HashMap::new(),
            queued_voters: VecDeque::new(),
            next_seq: 0,
            last_role,
            tick_interval,
        }
    }

    /// Runs until shutdown is requested, the engine handle is dropped or the
    /// node fails. Waiting callers are answered and the published status is
    /// reset on every exit.
    pub(crate) fn run(mut self) -> Result<()> {
        let result = self.serve();
        self.stop();
        result
    }

    fn serve(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = self
                .tick_interval
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.requests) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_request(req) {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.inbound) -> inbound => {
                    if let Ok(inbound) = inbound {
                        self.handle_inbound(inbound);
                    }
                }
                recv(self.send_reports) -> report => {
                    if let Ok(report) = report {
                        self.handle_send_report(report);
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= self.tick_interval {
                self.node.tick();
                last_tick = Instant::now();
                self.pending.retain(|_, pending| !pending.is_closed());
                self.queued_voters.retain(|queued| !queued.respond_to.is_closed());
            }

            self.propose_queued_voters();
            self.process_ready()?;
            self.publish_status();
        }
        Ok(())
    }

    /// Returns `false` once shutdown was requested.
    fn handle_request(&mut self, req: EngineRequest) -> bool {
        match req {
            EngineRequest::Submit { entry, respond_to } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(CacheError::NotLeader));
                    return true;
                }
                let (seq, ctx) = self.next_context();
                match self.node.propose(ctx, entry) {
                    Ok(()) => {
                        self.pending.insert(seq, Pending::Submit(respond_to));
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(err));
                    }
                }
            }
            EngineRequest::AddVoter {
                node_id,
                member,
                respond_to,
            } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(CacheError::NotLeader));
                    return true;
                }
                self.queued_voters.push_back(QueuedVoter {
                    node_id,
                    member,
                    respond_to,
                });
            }
            EngineRequest::Bootstrap {
                http_addr,
                respond_to,
            } => {
                let _ = respond_to.send(self.node.bootstrap(&http_addr));
            }
            EngineRequest::Shutdown => return false,
        }
        true
    }

    /// Proposes queued voter additions once no conf change is in flight.
    /// Existing voters only get their addresses refreshed.
    fn propose_queued_voters(&mut self) {
        while self.node.role() == StateRole::Leader && !self.node.has_pending_conf() {
            let Some(queued) = self.queued_voters.pop_front() else {
                return;
            };
            if queued.respond_to.is_closed() {
                continue;
            }
            if self.node.is_voter(queued.node_id) {
                self.node.record_member(queued.node_id, &queued.member);
                let _ = self.membership.send(queued.member);
                let _ = queued.respond_to.send(Ok(()));
                continue;
            }
            let (seq, ctx) = self.next_context();
            match self
                .node
                .propose_add_voter(ctx, queued.node_id, &queued.member)
            {
                Ok(()) => {
                    debug!(member = queued.node_id, raft = %queued.member.raft_addr, "proposed new voter");
                    self.pending.insert(seq, Pending::AddVoter(queued.respond_to));
                }
                Err(err) => {
                    let _ = queued.respond_to.send(Err(err));
                }
            }
        }
    }

    fn next_context(&mut self) -> (u64, Vec<u8>) {
        self.next_seq += 1;
        (self.next_seq, proposal_context(self.node.id(), self.next_seq))
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound { from_addr, message } = inbound;
        if message.from != raft::INVALID_ID && !from_addr.is_empty() {
            let mut peers = self.peers.write();
            if peers.get(&message.from) != Some(&from_addr) {
                debug!(peer = message.from, address = %from_addr, "learned peer address");
                peers.insert(message.from, from_addr);
            }
        }
        if let Err(err) = self.node.step(message) {
            debug!(error = %err, "dropped raft message");
        }
    }

    fn handle_send_report(&mut self, report: SendReport) {
        if !report.delivered {
            self.node.report_unreachable(report.to);
        }
        if report.snapshot {
            let status = if report.delivered {
                SnapshotStatus::Finish
            } else {
                SnapshotStatus::Failure
            };
            self.node.report_snapshot(report.to, status);
        }
    }

    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch(msg);
            }
            for report in bundle.applied {
                self.notify_applied(report);
            }
            for member in bundle.members {
                // No subscribers is fine.
                let _ = self.membership.send(member);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, msg: Message) {
        if msg.to == self.node.id() {
            if let Err(err) = self.node.step(msg) {
                debug!(error = %err, "dropped local raft message");
            }
            return;
        }
        let to = msg.to;
        let addr = self.peers.read().get(&to).cloned();
        match addr {
            Some(addr) => self.outbox.send(&addr, msg),
            None => {
                warn!(peer = to, "no address for peer, dropping message");
                self.node.report_unreachable(to);
            }
        }
    }

    fn notify_applied(&mut self, report: ApplyReport) {
        debug!(
            node = self.node.id(),
            index = report.index,
            term = report.term,
            ok = report.outcome.is_ok(),
            "applied entry"
        );
        let Some((proposer, seq)) = parse_context(&report.context) else {
            return;
        };
        if proposer != self.node.id() {
            return;
        }
        if let Some(pending) = self.pending.remove(&seq) {
            pending.complete(report);
        }
    }

    fn publish_status(&mut self) {
        let current = self.node.role();
        let next = EngineStatus {
            role: Role::from(current),
            leader_id: self.node.leader_id(),
            term: self.node.term(),
        };
        {
            let mut status = self.status.write();
            if *status != next {
                *status = next;
            }
        }

        if current == self.last_role {
            return;
        }
        info!(
            node = self.node.id(),
            from = ?self.last_role,
            to = ?current,
            leader = self.node.leader_id(),
            term = self.node.term(),
            "role changed"
        );
        let was_leader = self.last_role == StateRole::Leader;
        let is_leader = current == StateRole::Leader;
        self.last_role = current;

        if was_leader && !is_leader {
            for (_, pending) in self.pending.drain() {
                pending.fail(CacheError::LeadershipLost);
            }
            for queued in self.queued_voters.drain(..) {
                let _ = queued.respond_to.send(Err(CacheError::NotLeader));
            }
        }
        if was_leader != is_leader {
            // No subscribers is fine.
            let _ = self.leadership.send(is_leader);
        }
    }

    fn stop(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.fail(CacheError::Engine("consensus engine stopped".to_string()));
        }
        for queued in self.queued_voters.drain(..) {
            let _ = queued
                .respond_to
                .send(Err(CacheError::Engine("consensus engine stopped".to_string())));
        }
        *self.status.write() = EngineStatus::default();
        if self.last_role == StateRole::Leader {
            self.last_role = StateRole::Follower;
            let _ = self.leadership.send(false);
        }
        info!(node = self.node.id(), "raft worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::thread;

    use super::*;
    use crate::command::Command;
    use crate::fsm::{CacheFsm, StateMachine};
    use crate::raft_engine::node::SnapshotFrame;
    use crate::snapshot::SnapshotCarrier;
    use crate::store::KvStore;
    use crossbeam_channel::{Sender, unbounded};
    use raft::prelude::{ConfState, MessageType, Snapshot};
    use tokio::sync::oneshot::error::TryRecvError;

    /// Refuses every snapshot it is asked to restore.
    struct RejectingRestore(CacheFsm);

    impl StateMachine for RejectingRestore {
        fn apply(&self, entry: &[u8]) -> Result<()> {
            self.0.apply(entry)
        }

        fn snapshot(&self) -> Result<SnapshotCarrier> {
            self.0.snapshot()
        }

        fn restore(&self, mut source: Box<dyn Read + Send>) -> Result<()> {
            let mut sink = Vec::new();
            let _ = source.read_to_end(&mut sink);
            Err(CacheError::Snapshot("corrupt snapshot".to_string()))
        }
    }

    /// Worker for node 1 driven step by step from the test thread.
    struct Harness {
        worker: Worker,
        requests: Sender<EngineRequest>,
        inbound: Sender<Inbound>,
        status: Arc<RwLock<EngineStatus>>,
        leadership: broadcast::Receiver<bool>,
        membership: broadcast::Receiver<Member>,
    }

    /// Address nothing listens on; sends to it fail fast.
    const DEAD_PEER: &str = "127.0.0.1:1";

    impl Harness {
        fn new(fsm: Arc<dyn StateMachine>) -> Self {
            let peers: PeerBook = Arc::new(RwLock::new(HashMap::from([(1, "n1".to_string())])));
            let node = RaftNode::new(1, fsm, peers.clone(), 0).unwrap();
            let (request_tx, request_rx) = unbounded();
            let (inbound_tx, inbound_rx) = unbounded();
            let (report_tx, report_rx) = unbounded();
            let status = Arc::new(RwLock::new(EngineStatus::default()));
            let (leadership_tx, leadership) = broadcast::channel(16);
            let (membership_tx, membership) = broadcast::channel(16);
            let worker = Worker::new(
                node,
                peers,
                request_rx,
                inbound_rx,
                report_rx,
                Outbox::new("n1", report_tx),
                status.clone(),
                leadership_tx,
                membership_tx,
                Duration::from_millis(20),
            );
            Self {
                worker,
                requests: request_tx,
                inbound: inbound_tx,
                status,
                leadership,
                membership,
            }
        }

        fn request<T>(
            &mut self,
            build: impl FnOnce(oneshot::Sender<Result<T>>) -> EngineRequest,
        ) -> oneshot::Receiver<Result<T>> {
            let (tx, rx) = oneshot::channel();
            assert!(self.worker.handle_request(build(tx)));
            rx
        }

        /// One pass of the worker loop without waiting for events.
        fn settle(&mut self) {
            self.worker.propose_queued_voters();
            self.worker.process_ready().unwrap();
            self.worker.publish_status();
        }

        /// Bootstraps node 1 and adds node 2, which never answers, so
        /// later entries stay uncommitted.
        fn leader_without_quorum(&mut self) {
            let mut booted = self.request(|respond_to| EngineRequest::Bootstrap {
                http_addr: "h1".to_string(),
                respond_to,
            });
            assert_eq!(booted.try_recv().unwrap(), Ok(()));
            self.settle();
            assert_eq!(self.status.read().role, Role::Leader);
            assert_eq!(self.leadership.try_recv().unwrap(), true);

            let mut added = self.request(|respond_to| EngineRequest::AddVoter {
                node_id: 2,
                member: Member {
                    raft_addr: DEAD_PEER.to_string(),
                    http_addr: "h2".to_string(),
                },
                respond_to,
            });
            self.settle();
            assert_eq!(added.try_recv().unwrap(), Ok(()));
            assert!(self.worker.node.is_voter(2));
        }

        fn submit(&mut self, key: &str) -> oneshot::Receiver<Result<Commit>> {
            let entry = Command::set([key, "v"]).encode().unwrap();
            let mut rx = self.request(|respond_to| EngineRequest::Submit { entry, respond_to });
            self.settle();
            assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
            rx
        }
    }

    fn message_from_peer(msg_type: MessageType, from: u64, term: u64) -> Message {
        let mut msg = Message::default();
        msg.set_msg_type(msg_type);
        msg.from = from;
        msg.to = 1;
        msg.term = term;
        msg
    }

    #[test]
    fn context_round_trips_and_rejects_foreign_shapes() {
        let ctx = proposal_context(42, 7);
        assert_eq!(parse_context(&ctx), Some((42, 7)));
        assert_eq!(parse_context(&[]), None);
        assert_eq!(parse_context(b"a-key"), None);
    }

    #[test]
    fn step_down_fails_waiting_submissions() {
        let store = Arc::new(KvStore::new());
        let mut harness = Harness::new(Arc::new(CacheFsm::new(store.clone())));
        harness.leader_without_quorum();
        let mut waiting = harness.submit("k");

        // A heartbeat from a newer term turns the leader into a follower.
        harness.worker.handle_inbound(Inbound {
            from_addr: DEAD_PEER.to_string(),
            message: message_from_peer(MessageType::MsgHeartbeat, 2, 5),
        });
        harness.settle();

        assert_eq!(waiting.try_recv().unwrap(), Err(CacheError::LeadershipLost));
        let status = *harness.status.read();
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.leader_id, 2);
        assert_eq!(status.term, 5);
        assert_eq!(harness.leadership.try_recv().unwrap(), false);
        assert_eq!(store.get("k"), Err(CacheError::NotFound));

        // Followers refuse new work instead of queueing it.
        let mut refused = harness.request(|respond_to| EngineRequest::Submit {
            entry: Command::set(["k", "v"]).encode().unwrap(),
            respond_to,
        });
        assert_eq!(refused.try_recv().unwrap(), Err(CacheError::NotLeader));
    }

    #[test]
    fn voter_additions_are_serialized() {
        let store = Arc::new(KvStore::new());
        let mut harness = Harness::new(Arc::new(CacheFsm::new(store)));
        let mut booted = harness.request(|respond_to| EngineRequest::Bootstrap {
            http_addr: "h1".to_string(),
            respond_to,
        });
        assert_eq!(booted.try_recv().unwrap(), Ok(()));
        harness.settle();

        let mut joins: Vec<_> = [(2, "127.0.0.1:2"), (3, "127.0.0.1:3")]
            .into_iter()
            .map(|(node_id, raft_addr)| {
                harness.request(|respond_to| EngineRequest::AddVoter {
                    node_id,
                    member: Member {
                        raft_addr: raft_addr.to_string(),
                        http_addr: format!("h{node_id}"),
                    },
                    respond_to,
                })
            })
            .collect();
        assert!(harness.worker.peers.read().get(&3).is_none());

        // Node 1 alone is a quorum for the first change. The second is only
        // proposed once the first is applied.
        harness.settle();
        assert_eq!(joins[0].try_recv().unwrap(), Ok(()));
        assert!(!harness.worker.node.is_voter(3));
        harness.settle();
        harness.settle();

        assert!(harness.worker.node.is_voter(2));
        assert_eq!(harness.membership.try_recv().unwrap().http_addr, "h2");
        assert_eq!(harness.worker.peers.read().get(&2).map(String::as_str), Some("127.0.0.1:2"));
        // The second change needs node 2, which is not running.
        assert_eq!(joins[1].try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn failed_snapshot_install_stops_the_worker() {
        let store = Arc::new(KvStore::new());
        let fsm = Arc::new(RejectingRestore(CacheFsm::new(store.clone())));
        let mut harness = Harness::new(fsm);
        harness.leader_without_quorum();
        let mut waiting = harness.submit("k");

        let frame = SnapshotFrame {
            peers: HashMap::from([(3, DEAD_PEER.to_string())]),
            services: HashMap::new(),
            state: b"{}".to_vec(),
        };
        let mut snapshot = Snapshot::default();
        snapshot.data = bincode::serialize(&frame).unwrap().into();
        let meta = snapshot.mut_metadata();
        meta.index = 100;
        meta.term = 5;
        meta.set_conf_state(ConfState::from((vec![1, 3], vec![])));
        let mut message = message_from_peer(MessageType::MsgSnapshot, 3, 5);
        message.set_snapshot(snapshot);
        harness
            .inbound
            .send(Inbound {
                from_addr: DEAD_PEER.to_string(),
                message,
            })
            .unwrap();

        let Harness {
            worker,
            requests,
            status,
            mut leadership,
            inbound: _inbound,
            ..
        } = harness;
        let running = thread::spawn(move || worker.run());
        // Only reached if the install did not fail.
        thread::sleep(Duration::from_millis(500));
        let _ = requests.send(EngineRequest::Shutdown);

        let result = running.join().unwrap();
        assert_eq!(result, Err(CacheError::Snapshot("corrupt snapshot".to_string())));
        assert_eq!(*status.read(), EngineStatus::default());
        assert_eq!(leadership.try_recv().unwrap(), false);
        assert!(matches!(waiting.try_recv().unwrap(), Err(CacheError::Engine(_))));
        assert_eq!(store.get("k"), Err(CacheError::NotFound));
    }
}

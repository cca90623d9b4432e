//! Raft log storage that can serve application snapshots.
//!
//! `MemStorage` keeps the log, hard state and conf state but builds
//! snapshots without any application data. `LogStore` wraps it and keeps the
//! last compaction snapshot so lagging followers can be caught up from it.
//! When that snapshot is missing or too old for a follower, the request is
//! flagged and the owning node builds a fresh one; raft retries on the next
//! heartbeat.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::MemStorage;
use raft::{GetEntriesContext, RaftState, Storage, StorageError};

#[derive(Clone, Default)]
pub struct LogStore {
    mem: MemStorage,
    snapshot: Arc<RwLock<Snapshot>>,
    snapshot_wanted: Arc<AtomicBool>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage for a node that starts out as the only voter.
    pub fn with_voters(voters: Vec<u64>) -> Self {
        Self {
            mem: MemStorage::new_with_conf_state(ConfState::from((voters, vec![]))),
            snapshot: Arc::default(),
            snapshot_wanted: Arc::default(),
        }
    }

    pub fn append(&self, entries: &[Entry]) -> raft::Result<()> {
        self.mem.wl().append(entries)
    }

    pub fn set_hardstate(&self, hs: HardState) {
        self.mem.wl().set_hardstate(hs);
    }

    pub fn set_commit(&self, commit: u64) {
        self.mem.wl().mut_hard_state().set_commit(commit);
    }

    pub fn set_conf_state(&self, cs: ConfState) {
        self.mem.wl().set_conf_state(cs);
    }

    /// Installs a snapshot received from the leader, replacing the log.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> raft::Result<()> {
        self.mem.wl().apply_snapshot(snapshot.clone())?;
        *self.snapshot.write() = snapshot;
        Ok(())
    }

    /// Records a locally built snapshot and drops the log before its index.
    pub fn compact_to(&self, snapshot: Snapshot) -> raft::Result<()> {
        let index = snapshot.get_metadata().index;
        *self.snapshot.write() = snapshot;
        self.mem.wl().compact(index)
    }

    /// Index covered by the latest snapshot, 0 if there is none.
    pub fn snapshot_index(&self) -> u64 {
        self.snapshot.read().get_metadata().index
    }

    /// Returns whether raft asked for a snapshot that could not be served,
    /// clearing the request.
    pub fn take_snapshot_request(&self) -> bool {
        self.snapshot_wanted.swap(false, Ordering::AcqRel)
    }
}

impl Storage for LogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        {
            let snapshot = self.snapshot.read();
            let meta = snapshot.get_metadata();
            if idx != 0 && idx == meta.index {
                return Ok(meta.term);
            }
        }
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let snapshot = self.snapshot.read();
        let meta = snapshot.get_metadata();
        let cs = meta.get_conf_state();
        // A follower refuses a snapshot whose configuration does not list it.
        let knows_target = cs.voters.contains(&to) || cs.learners.contains(&to);
        if meta.index == 0 || meta.index < request_index || !knows_target {
            self.snapshot_wanted.store(true, Ordering::Release);
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(snapshot.clone())
    }
}

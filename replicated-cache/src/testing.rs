//! Test doubles shared by the unit tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::engine::{Commit, ConsensusEngine, Member, Role};
use crate::error::{CacheError, Result};
use crate::fsm::{CacheFsm, StateMachine};
use crate::store::KvStore;
use crate::transport::ClusterTransport;

/// Engine double whose role and leader are set by the test. Submitted
/// entries are applied straight to the store unless a failure is queued.
pub struct FakeEngine {
    pub role: Mutex<Role>,
    pub leader: Mutex<Option<String>>,
    pub fsm: CacheFsm,
    pub submit_error: Mutex<Option<CacheError>>,
    pub submitted: Mutex<Vec<Vec<u8>>>,
    pub add_voter_error: Mutex<Option<CacheError>>,
    pub voters: Mutex<Vec<(String, String)>>,
    pub bootstrapped: Mutex<Option<(String, String)>>,
    pub leadership: broadcast::Sender<bool>,
    pub membership: broadcast::Sender<Member>,
}

impl FakeEngine {
    pub fn new(role: Role, leader: Option<&str>) -> Arc<Self> {
        let (leadership, _) = broadcast::channel(8);
        let (membership, _) = broadcast::channel(8);
        Arc::new(Self {
            role: Mutex::new(role),
            leader: Mutex::new(leader.map(str::to_string)),
            fsm: CacheFsm::new(Arc::new(KvStore::new())),
            submit_error: Mutex::new(None),
            submitted: Mutex::new(Vec::new()),
            add_voter_error: Mutex::new(None),
            voters: Mutex::new(Vec::new()),
            bootstrapped: Mutex::new(None),
            leadership,
            membership,
        })
    }

    pub fn store(&self) -> &KvStore {
        self.fsm.store()
    }
}

#[async_trait]
impl ConsensusEngine for FakeEngine {
    async fn submit(&self, entry: Vec<u8>, _timeout: Duration) -> Result<Commit> {
        self.submitted.lock().push(entry.clone());
        if let Some(err) = self.submit_error.lock().take() {
            return Err(err);
        }
        let index = self.submitted.lock().len() as u64;
        Ok(Commit {
            index,
            term: 1,
            applied: self.fsm.apply(&entry),
        })
    }

    fn role(&self) -> Role {
        *self.role.lock()
    }

    fn leader(&self) -> Option<String> {
        self.leader.lock().clone()
    }

    async fn add_voter(&self, id: &str, address: &str) -> Result<()> {
        if let Some(err) = self.add_voter_error.lock().take() {
            return Err(err);
        }
        self.voters.lock().push((id.to_string(), address.to_string()));
        Ok(())
    }

    async fn bootstrap(&self, id: &str, address: &str) -> Result<()> {
        *self.bootstrapped.lock() = Some((id.to_string(), address.to_string()));
        Ok(())
    }

    fn subscribe_leadership(&self) -> broadcast::Receiver<bool> {
        self.leadership.subscribe()
    }

    fn subscribe_membership(&self) -> broadcast::Receiver<Member> {
        self.membership.subscribe()
    }
}

/// Records every call and answers with a queued reply.
#[derive(Default)]
pub struct RecordingTransport {
    pub calls: Mutex<Vec<(String, String, Vec<u8>)>>,
    pub reply: Mutex<Option<Result<Vec<u8>>>>,
}

impl RecordingTransport {
    pub fn replying(reply: Result<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            reply: Mutex::new(Some(reply)),
        })
    }
}

#[async_trait]
impl ClusterTransport for RecordingTransport {
    async fn post(&self, addr: &str, uri: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        self.calls
            .lock()
            .push((addr.to_string(), uri.to_string(), body));
        self.reply
            .lock()
            .take()
            .unwrap_or_else(|| Err(CacheError::Network("no reply queued".into())))
    }
}

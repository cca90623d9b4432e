//! Error taxonomy shared by the store, the state machine, the coordinator and
//! the consensus adapter.
//!
//! Every kind maps to an HTTP status so the service layer can answer with a
//! `{retcode, retdesc}` pair without inspecting error strings.

use thiserror::Error;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Read miss. Expected; never logged as an error.
    #[error("key is not exist")]
    NotFound,

    /// A Command or snapshot blob could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The command carried an operation code this store does not know.
    #[error("unsupported command op {0}")]
    UnsupportedCommand(i64),

    /// No leader is known, or the leader's service address is not in the
    /// membership mapping.
    #[error("no leader available")]
    NoLeader,

    /// The engine refused a proposal because this node is not the leader.
    #[error("node is not the leader")]
    NotLeader,

    /// The submit deadline elapsed. The entry may still commit.
    #[error("timed out waiting for commit")]
    SubmitTimeout,

    /// Leadership was lost while the entry was pending. The entry may still commit.
    #[error("leadership lost while entry was pending")]
    LeadershipLost,

    /// Joining an existing cluster failed at startup.
    #[error("join raft cluster failed: {0}")]
    JoinFailed(String),

    /// A forwarded or join round trip failed at the transport level.
    #[error("network error: {0}")]
    Network(String),

    /// The remote service answered with an error result.
    #[error("remote error ({code}): {desc}")]
    Remote { code: u16, desc: String },

    /// The consensus library or its log storage failed.
    #[error("consensus engine error: {0}")]
    Engine(String),

    /// Writing or closing a snapshot sink failed.
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl CacheError {
    /// HTTP status used when this error is reported to a client.
    pub fn status_code(&self) -> u16 {
        match self {
            CacheError::NotFound => 404,
            CacheError::Decode(_) | CacheError::UnsupportedCommand(_) => 400,
            CacheError::NoLeader | CacheError::NotLeader | CacheError::LeadershipLost => 503,
            CacheError::SubmitTimeout => 504,
            CacheError::Network(_) => 502,
            CacheError::Remote { code, .. } => *code,
            CacheError::JoinFailed(_) | CacheError::Engine(_) | CacheError::Snapshot(_) => 500,
        }
    }

    /// Whether a caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::NoLeader | CacheError::NotLeader | CacheError::Network(_)
        )
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Decode(err.to_string())
    }
}

impl From<raft::Error> for CacheError {
    fn from(err: raft::Error) -> Self {
        match err {
            raft::Error::ProposalDropped => CacheError::NotLeader,
            other => CacheError::Engine(other.to_string()),
        }
    }
}

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:6380";
pub const DEFAULT_RAFT_ADDR: &str = "127.0.0.1:6381";

/// Bounded wait for a submitted entry to commit.
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(5);
/// Round-trip limit for forwarded writes and join calls.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);
/// Committed entries between two log compactions.
pub const SNAPSHOT_THRESHOLD: u64 = 1024;
/// Consensus logical clock. Election fires after 10 ticks, heartbeats every 3.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);
/// Daily log files kept under `--log-dir`.
pub const LOG_RETENTION_FILES: usize = 7;

/// Command-line arguments for a cache node.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Run a replicated cache node")]
pub struct Args {
    /// Service address clients and peers reach this node on
    #[arg(long, default_value = DEFAULT_HTTP_ADDR)]
    pub http: String,

    /// Replication address; also this node's identity in the cluster
    #[arg(long, default_value = DEFAULT_RAFT_ADDR)]
    pub raft: String,

    /// Service address of an existing member to join. Bootstraps a new
    /// cluster when omitted.
    #[arg(long)]
    pub join: Option<String>,

    /// Committed entries between log compactions
    #[arg(long, default_value_t = SNAPSHOT_THRESHOLD)]
    pub snapshot_threshold: u64,

    /// Also write logs to daily rotated files in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub http_addr: String,
    pub raft_addr: String,
    pub join_addr: Option<String>,
    pub apply_timeout: Duration,
    pub forward_timeout: Duration,
    pub snapshot_threshold: u64,
    pub tick_interval: Duration,
}

impl NodeConfig {
    pub fn new(http_addr: impl Into<String>, raft_addr: impl Into<String>) -> Self {
        Self {
            http_addr: http_addr.into(),
            raft_addr: raft_addr.into(),
            join_addr: None,
            apply_timeout: APPLY_TIMEOUT,
            forward_timeout: FORWARD_TIMEOUT,
            snapshot_threshold: SNAPSHOT_THRESHOLD,
            tick_interval: TICK_INTERVAL,
        }
    }

    pub fn join(mut self, addr: impl Into<String>) -> Self {
        self.join_addr = Some(addr.into());
        self
    }

    pub fn snapshot_threshold(mut self, entries: u64) -> Self {
        self.snapshot_threshold = entries;
        self
    }
}

impl From<Args> for NodeConfig {
    fn from(args: Args) -> Self {
        let mut config = NodeConfig::new(args.http, args.raft).snapshot_threshold(args.snapshot_threshold);
        config.join_addr = args.join.filter(|addr| !addr.is_empty());
        config
    }
}

//! Runs one replicated cache node until ctrl-c.
//!
//! Start a three-node cluster:
//! ```bash
//! # Terminal 1: bootstraps the cluster
//! cargo run --bin node -- --http 127.0.0.1:6380 --raft 127.0.0.1:6381
//!
//! # Terminals 2 and 3: join through any member
//! cargo run --bin node -- --http 127.0.0.1:6390 --raft 127.0.0.1:6391 --join 127.0.0.1:6380
//! cargo run --bin node -- --http 127.0.0.1:6400 --raft 127.0.0.1:6401 --join 127.0.0.1:6380
//!
//! curl -XPOST 127.0.0.1:6390/set -d '{"datas":["a","1"]}'
//! curl '127.0.0.1:6400/get?key=a'
//! ```
//!
//! Pass `--log-dir <dir>` to also keep a week of daily log files.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use replicated_cache::config::{Args, NodeConfig, LOG_RETENTION_FILES};
use replicated_cache::node::CacheNode;

/// Logs to stdout, and to `log_dir` when given. The returned guard flushes
/// the file writer on drop, so it must live until exit.
fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("node")
                .filename_suffix("log")
                .max_log_files(LOG_RETENTION_FILES)
                .build(dir)
                .with_context(|| format!("failed to open log directory {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_dir.as_deref())?;

    let config = NodeConfig::from(args);
    let node = CacheNode::start(config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    node.shutdown().await;
    Ok(())
}

//! A running cache node: store, consensus engine, coordinator and HTTP
//! service wired together.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::coordinator::ClusterCoordinator;
use crate::fsm::CacheFsm;
use crate::raft_engine::{EngineConfig, RaftEngine};
use crate::server::{self, AppState};
use crate::store::KvStore;
use crate::transport::HttpTransport;

pub struct CacheNode {
    store: Arc<KvStore>,
    engine: Arc<RaftEngine>,
    coordinator: Arc<ClusterCoordinator>,
    http_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<std::io::Result<()>>,
    cluster_watch: JoinHandle<()>,
}

impl CacheNode {
    /// Starts every component, then bootstraps a new cluster or joins the
    /// one behind `config.join_addr`. The HTTP service is already accepting
    /// requests when this returns.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let store = Arc::new(KvStore::new());
        let fsm = Arc::new(CacheFsm::new(store.clone()));
        let engine = Arc::new(
            RaftEngine::spawn(EngineConfig::from(&config), fsm)
                .with_context(|| format!("failed to start raft engine on {}", config.raft_addr))?,
        );
        let transport = Arc::new(
            HttpTransport::new(config.forward_timeout).context("failed to build http client")?,
        );
        let coordinator = Arc::new(
            ClusterCoordinator::new(
                config.http_addr.clone(),
                config.raft_addr.clone(),
                engine.clone(),
                transport,
            )
            .with_apply_timeout(config.apply_timeout),
        );

        let listener = TcpListener::bind(&config.http_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.http_addr))?;
        let http_addr = listener.local_addr().context("failed to read local address")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = AppState {
            store: store.clone(),
            coordinator: coordinator.clone(),
        };
        let server = tokio::spawn(server::serve(listener, state, async {
            let _ = shutdown_rx.await;
        }));
        let cluster_watch = coordinator.spawn_cluster_watch();

        let node = Self {
            store,
            engine,
            coordinator,
            http_addr,
            shutdown_tx,
            server,
            cluster_watch,
        };

        let started = node.coordinator.start(config.join_addr.as_deref()).await;
        if let Err(err) = started {
            node.shutdown().await;
            return Err(err).context("failed to join or bootstrap the cluster");
        }
        info!(http = %http_addr, raft = %config.raft_addr, "cache node started");
        Ok(node)
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<ClusterCoordinator> {
        &self.coordinator
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Stops serving, then stops the consensus engine.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        match self.server.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "http server failed"),
            Err(err) => warn!(error = %err, "http server task panicked"),
        }
        self.engine.shutdown();
        self.cluster_watch.abort();
        info!(http = %self.http_addr, "cache node stopped");
    }
}

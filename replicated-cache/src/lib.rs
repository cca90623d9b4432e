//! Replicated in-memory key-value cache.
//!
//! Every node keeps the full key space in memory. Writes (multi-key sets and
//! deletes) are ordered by raft and applied on every node in log order, so all
//! nodes converge to the same contents. Reads are served locally and may lag
//! the leader.
//!
//! # Architecture
//!
//! - **HTTP service** ([`server`]): client reads/writes and the join endpoint
//! - **Coordinator** ([`coordinator`]): submits writes when leader, forwards
//!   them to the leader otherwise, runs the join protocol and tracks
//!   membership
//! - **Consensus engine** ([`engine`], [`raft_engine`]): orders entries and
//!   drives the state machine from a dedicated worker thread
//! - **State machine** ([`fsm`], [`store`], [`snapshot`]): applies committed
//!   commands and produces or restores snapshots for log compaction
//!
//! The worker thread and the peer network threads talk over crossbeam
//! channels; the async side reaches the worker through a request channel and
//! tokio oneshots.
//!
//! # Modules
//!
//! - [`command`]: commands replicated through the log
//! - [`protocol`]: JSON shapes exchanged with clients and between nodes
//! - [`transport`]: node-to-node HTTP calls
//! - [`config`]: command-line and node configuration
//! - [`node`]: wiring everything into a running node

pub mod command;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod node;
pub mod protocol;
pub mod raft_engine;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

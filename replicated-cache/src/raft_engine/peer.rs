//! Consensus traffic between nodes.
//!
//! Every raft message travels on its own short-lived TCP connection:
//!
//! - 4 bytes: frame length (big-endian u32)
//! - N bytes: bincode-encoded [`PeerFrame`]
//!
//! The frame wraps the protobuf-encoded raft message together with the
//! sender's replication address, so a receiver learns how to reach a peer the
//! first time it hears from it.
//!
//! Outgoing messages go through an [`Outbox`] with one sender thread per
//! destination, so a slow or dead peer never blocks the raft worker.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError, bounded};
use prost::Message as ProstMessage;
use raft::prelude::{Message, MessageType};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(300);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Messages queued per destination before new ones are dropped.
const LANE_CAPACITY: usize = 1024;
/// Upper bound on an accepted frame; snapshots carry the whole cache.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct PeerFrame {
    from_addr: String,
    message: Vec<u8>,
}

/// A raft message received from a peer, tagged with its replication address.
pub struct Inbound {
    pub from_addr: String,
    pub message: Message,
}

/// Binds `addr` and forwards every received message to `tx` from a
/// background thread. Binding happens before returning so an occupied port
/// fails startup.
pub fn spawn_listener(addr: &str, tx: Sender<Inbound>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .map_err(|err| CacheError::Network(format!("failed to bind {addr}: {err}")))?;

    thread::Builder::new()
        .name(format!("raft-listener-{addr}"))
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, &tx) {
                                debug!(error = %err, "peer connection dropped");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                }
            }
        })
        .map_err(|err| CacheError::Engine(format!("failed to spawn listener: {err}")))?;
    Ok(())
}

fn handle_connection(mut stream: TcpStream, tx: &Sender<Inbound>) -> io::Result<()> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;

    let frame: PeerFrame = bincode::deserialize(&buf)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let message = Message::decode(&frame.message[..])
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

    tx.send(Inbound {
        from_addr: frame.from_addr,
        message,
    })
    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))
}

/// Sends one message to the peer at `addr`, identifying ourselves as
/// `from_addr`.
pub fn send(addr: &str, from_addr: &str, msg: &Message) -> io::Result<()> {
    let frame = PeerFrame {
        from_addr: from_addr.to_string(),
        message: msg.encode_to_vec(),
    };
    let bytes =
        bincode::serialize(&frame).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;

    let target = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, addr.to_string()))?;
    let mut stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()
}

/// Delivery result the worker feeds back into raft: failures mark the peer
/// unreachable, snapshot results finish or abort the snapshot transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub to: u64,
    pub snapshot: bool,
    pub delivered: bool,
}

pub struct Outbox {
    from_addr: String,
    lanes: HashMap<String, Sender<Message>>,
    reports: Sender<SendReport>,
}

impl Outbox {
    pub fn new(from_addr: impl Into<String>, reports: Sender<SendReport>) -> Self {
        Self {
            from_addr: from_addr.into(),
            lanes: HashMap::new(),
            reports,
        }
    }

    /// Queues `msg` for the peer at `addr`. A full or dead lane drops the
    /// message and reports it undelivered; raft retransmits.
    pub fn send(&mut self, addr: &str, msg: Message) {
        let to = msg.to;
        let snapshot = msg.msg_type() == MessageType::MsgSnapshot;
        let lane = self
            .lanes
            .entry(addr.to_string())
            .or_insert_with(|| spawn_lane(addr, &self.from_addr, self.reports.clone()));

        match lane.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(peer = addr, "send queue full, dropping message");
                let _ = self.reports.send(SendReport { to, snapshot, delivered: false });
            }
            Err(TrySendError::Disconnected(_)) => {
                self.lanes.remove(addr);
                let _ = self.reports.send(SendReport { to, snapshot, delivered: false });
            }
        }
    }
}

fn spawn_lane(addr: &str, from_addr: &str, reports: Sender<SendReport>) -> Sender<Message> {
    let (tx, rx) = bounded::<Message>(LANE_CAPACITY);
    let name = format!("raft-send-{addr}");
    let addr = addr.to_string();
    let from_addr = from_addr.to_string();
    let spawned = thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            for msg in rx {
                let to = msg.to;
                let snapshot = msg.msg_type() == MessageType::MsgSnapshot;
                let delivered = match send(&addr, &from_addr, &msg) {
                    Ok(()) => true,
                    Err(err) => {
                        debug!(peer = %addr, error = %err, "failed to send raft message");
                        false
                    }
                };
                if snapshot || !delivered {
                    let _ = reports.send(SendReport { to, snapshot, delivered });
                }
            }
        });
    if let Err(err) = spawned {
        warn!(thread = %name, error = %err, "failed to spawn sender thread");
    }
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn frame_carries_sender_address() {
        let (tx, rx) = unbounded();
        spawn_listener("127.0.0.1:18191", tx).unwrap();

        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgHeartbeat);
        msg.from = 7;
        msg.to = 9;
        msg.term = 3;
        send("127.0.0.1:18191", "127.0.0.1:18190", &msg).unwrap();

        let inbound = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(inbound.from_addr, "127.0.0.1:18190");
        assert_eq!(inbound.message.from, 7);
        assert_eq!(inbound.message.to, 9);
        assert_eq!(inbound.message.term, 3);
        assert_eq!(inbound.message.msg_type(), MessageType::MsgHeartbeat);
    }

    #[test]
    fn occupied_port_fails_to_bind() {
        let (tx, _rx) = unbounded();
        let _held = TcpListener::bind("127.0.0.1:18192").unwrap();
        assert!(matches!(
            spawn_listener("127.0.0.1:18192", tx),
            Err(CacheError::Network(_))
        ));
    }

    #[test]
    fn unreachable_peer_is_an_error() {
        let msg = Message::default();
        assert!(send("127.0.0.1:1", "127.0.0.1:18193", &msg).is_err());
    }

    #[test]
    fn outbox_reports_failed_delivery() {
        let (reports_tx, reports_rx) = unbounded();
        let mut outbox = Outbox::new("127.0.0.1:18194", reports_tx);

        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgSnapshot);
        msg.to = 4;
        outbox.send("127.0.0.1:1", msg);

        let report = reports_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            report,
            SendReport {
                to: 4,
                snapshot: true,
                delivered: false
            }
        );
    }
}

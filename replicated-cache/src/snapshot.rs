//! Snapshot hand-off between the state machine and the consensus engine.

use std::io::{self, Write};

use crate::error::{CacheError, Result};

/// Destination for a persisted snapshot.
///
/// A sink is written once and then either closed (the snapshot is complete)
/// or cancelled (the partial data must be discarded).
pub trait SnapshotSink: Write {
    fn id(&self) -> &str;
    fn close(&mut self) -> io::Result<()>;
    fn cancel(&mut self) -> io::Result<()>;
}

/// An exported store blob waiting to be persisted.
#[derive(Debug, Clone)]
pub struct SnapshotCarrier {
    data: Vec<u8>,
}

impl SnapshotCarrier {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Writes the blob into `sink` and closes it. Any write or close failure
    /// cancels the sink before the error is returned.
    pub fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<()> {
        let outcome = sink.write_all(&self.data).and_then(|_| sink.close());
        if let Err(err) = outcome {
            if let Err(cancel_err) = sink.cancel() {
                tracing::warn!(sink = sink.id(), error = %cancel_err, "failed to cancel snapshot sink");
            }
            return Err(CacheError::Snapshot(err.to_string()));
        }
        Ok(())
    }

    /// Called once the engine no longer needs this snapshot.
    pub fn release(self) {}
}

/// Buffers a snapshot in memory until it is closed.
#[derive(Debug, Default)]
pub struct MemorySnapshotSink {
    id: String,
    buf: Vec<u8>,
    state: SinkState,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    #[default]
    Open,
    Closed,
    Cancelled,
}

impl MemorySnapshotSink {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    /// Returns the persisted bytes, only if the sink was closed successfully.
    pub fn into_contents(self) -> Option<Vec<u8>> {
        (self.state == SinkState::Closed).then_some(self.buf)
    }
}

impl Write for MemorySnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.state != SinkState::Open {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "snapshot sink is not open"));
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for MemorySnapshotSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn close(&mut self) -> io::Result<()> {
        if self.state != SinkState::Open {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "snapshot sink is not open"));
        }
        self.state = SinkState::Closed;
        Ok(())
    }

    fn cancel(&mut self) -> io::Result<()> {
        self.buf.clear();
        self.state = SinkState::Cancelled;
        Ok(())
    }
}

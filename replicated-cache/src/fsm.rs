//! The state machine the consensus engine drives.
//!
//! The engine calls [`StateMachine::apply`] for every committed normal entry,
//! in log order, on its own worker thread. Snapshot and restore are called on
//! the same thread, so the adapter adds no locking beyond the store's own.

use std::io::Read;
use std::sync::Arc;

use tracing::{debug, error};

use crate::command::Command;
use crate::error::{CacheError, Result};
use crate::snapshot::SnapshotCarrier;
use crate::store::KvStore;

pub trait StateMachine: Send + Sync {
    /// Applies one committed entry. A rejected entry stays committed; the
    /// error only describes the local apply outcome.
    fn apply(&self, entry: &[u8]) -> Result<()>;

    /// Captures the whole state for log compaction.
    fn snapshot(&self) -> Result<SnapshotCarrier>;

    /// Replaces the whole state from a snapshot stream. The stream is fully
    /// consumed and dropped whatever the outcome.
    fn restore(&self, source: Box<dyn Read + Send>) -> Result<()>;
}

/// Adapter between committed log bytes and the [`KvStore`].
pub struct CacheFsm {
    store: Arc<KvStore>,
}

impl CacheFsm {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }
}

impl StateMachine for CacheFsm {
    fn apply(&self, entry: &[u8]) -> Result<()> {
        let cmd = Command::decode(entry).inspect_err(|err| {
            error!(error = %err, "failed to decode committed entry");
        })?;
        self.store.apply_command(&cmd).inspect_err(|err| {
            error!(error = %err, "rejected committed entry");
        })
    }

    fn snapshot(&self) -> Result<SnapshotCarrier> {
        let data = self.store.export()?;
        debug!(bytes = data.len(), "exported store snapshot");
        Ok(SnapshotCarrier::new(data))
    }

    fn restore(&self, mut source: Box<dyn Read + Send>) -> Result<()> {
        let mut buf = Vec::new();
        source
            .read_to_end(&mut buf)
            .map_err(|err| CacheError::Decode(err.to_string()))?;
        drop(source);
        self.store.import(&buf)?;
        debug!(keys = self.store.len(), "restored store from snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};

    use super::*;
    use crate::command::CommandOp;

    fn fsm() -> CacheFsm {
        CacheFsm::new(Arc::new(KvStore::new()))
    }

    #[test]
    fn apply_decodes_and_mutates() {
        let fsm = fsm();
        let entry = Command::set(["a", "1", "b", "2"]).encode().unwrap();
        fsm.apply(&entry).unwrap();
        assert_eq!(fsm.store().get("a").unwrap(), "1");
        assert_eq!(fsm.store().get("b").unwrap(), "2");
    }

    #[test]
    fn malformed_entry_is_rejected_without_mutation() {
        let fsm = fsm();
        fsm.apply(&Command::set(["a", "1"]).encode().unwrap()).unwrap();

        assert!(matches!(fsm.apply(b"\x00\x01garbage"), Err(CacheError::Decode(_))));
        let unsupported = Command::new(CommandOp::Unknown(3), vec!["a".into()])
            .encode()
            .unwrap();
        assert_eq!(
            fsm.apply(&unsupported),
            Err(CacheError::UnsupportedCommand(3))
        );
        assert_eq!(fsm.store().get("a").unwrap(), "1");
    }

    #[test]
    fn snapshot_restores_into_other_fsm() {
        let source = fsm();
        source.apply(&Command::set(["x", "1", "y"]).encode().unwrap()).unwrap();
        let carrier = source.snapshot().unwrap();

        let target = fsm();
        target.apply(&Command::set(["z", "9"]).encode().unwrap()).unwrap();
        target
            .restore(Box::new(Cursor::new(carrier.data().to_vec())))
            .unwrap();

        assert_eq!(target.store().get("x").unwrap(), "1");
        assert_eq!(target.store().get("y").unwrap(), "");
        assert_eq!(target.store().get("z"), Err(CacheError::NotFound));
    }

    struct BrokenReader;

    impl Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream reset"))
        }
    }

    #[test]
    fn failed_restore_keeps_state() {
        let fsm = fsm();
        fsm.apply(&Command::set(["keep", "1"]).encode().unwrap()).unwrap();

        assert!(fsm.restore(Box::new(BrokenReader)).is_err());
        assert!(fsm.restore(Box::new(Cursor::new(b"nope".to_vec()))).is_err());
        assert_eq!(fsm.store().get("keep").unwrap(), "1");
    }
}

//! In-memory key-value storage for the replicated state machine.
//!
//! Commands from the committed log are applied here. Reads go straight to
//! the map without a consensus round-trip, so a follower may serve values
//! that lag the leader.

use std::collections::HashMap;
use std::io::Read;

use parking_lot::RwLock;

use crate::command::{Command, CommandOp};
use crate::error::{CacheError, Result};

/// Thread-safe key-value store used by each node.
///
/// Many concurrent readers, exclusive writers. Export and import also take
/// the exclusive lock so a snapshot observes a single point in the log.
#[derive(Default)]
pub struct KvStore {
    data: RwLock<HashMap<String, String>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::with_capacity(1024)),
        }
    }

    /// Returns the locally applied value for `key`.
    pub fn get(&self, key: &str) -> Result<String> {
        self.data.read().get(key).cloned().ok_or(CacheError::NotFound)
    }

    /// Applies one committed command as a single batch.
    ///
    /// Unknown operations are rejected before the lock is taken, so a
    /// rejected command never leaves a partial mutation behind.
    pub fn apply_command(&self, cmd: &Command) -> Result<()> {
        match cmd.op() {
            CommandOp::Set => {
                let mut data = self.data.write();
                for (key, value) in cmd.pairs() {
                    data.insert(key.to_string(), value.to_string());
                }
                Ok(())
            }
            CommandOp::Delete => {
                let mut data = self.data.write();
                for key in cmd.datas() {
                    data.remove(key);
                }
                Ok(())
            }
            CommandOp::Unknown(code) => Err(CacheError::UnsupportedCommand(code)),
        }
    }

    /// Serializes the whole map.
    pub fn export(&self) -> Result<Vec<u8>> {
        let data = self.data.write();
        Ok(serde_json::to_vec(&*data)?)
    }

    /// Replaces the whole map with a previously exported blob.
    ///
    /// Decoding happens before the lock is taken; on failure the current
    /// contents are left as they were.
    pub fn import(&self, bytes: &[u8]) -> Result<()> {
        let restored: HashMap<String, String> = serde_json::from_slice(bytes)?;
        *self.data.write() = restored;
        Ok(())
    }

    /// Same as [`KvStore::import`] but decodes from a reader, consuming it.
    pub fn import_from<R: Read>(&self, reader: R) -> Result<()> {
        let restored: HashMap<String, String> = serde_json::from_reader(reader)?;
        *self.data.write() = restored;
        Ok(())
    }

    /// Current key set, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

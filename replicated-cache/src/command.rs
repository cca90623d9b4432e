use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Operation kind of a replicated mutation.
///
/// Encoded on the wire as a bare integer (`0` = set, `1` = delete). Codes this
/// build does not know still decode, so the store can reject them without
/// touching its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum CommandOp {
    #[default]
    Set,
    Delete,
    Unknown(i64),
}

impl From<i64> for CommandOp {
    fn from(code: i64) -> Self {
        match code {
            0 => CommandOp::Set,
            1 => CommandOp::Delete,
            other => CommandOp::Unknown(other),
        }
    }
}

impl From<CommandOp> for i64 {
    fn from(op: CommandOp) -> Self {
        match op {
            CommandOp::Set => 0,
            CommandOp::Delete => 1,
            CommandOp::Unknown(code) => code,
        }
    }
}

/// A mutation that flows through the replicated log.
///
/// One command is one log entry and one atomic multi-key batch. For `Set`
/// the operands are alternating key/value pairs; for `Delete` every operand
/// is a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    op: CommandOp,
    #[serde(default)]
    datas: Vec<String>,
}

impl Command {
    pub fn new(op: CommandOp, datas: Vec<String>) -> Self {
        Self { op, datas }
    }

    pub fn set<I, S>(operands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CommandOp::Set, operands.into_iter().map(Into::into).collect())
    }

    pub fn delete<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CommandOp::Delete, keys.into_iter().map(Into::into).collect())
    }

    pub fn op(&self) -> CommandOp {
        self.op
    }

    pub fn datas(&self) -> &[String] {
        &self.datas
    }

    /// Returns a copy of this command carrying `op` instead of its own tag.
    pub fn with_op(&self, op: CommandOp) -> Self {
        Self::new(op, self.datas.clone())
    }

    /// Key/value pairs of a `Set`. An odd trailing key maps to `""`.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.datas
            .chunks(2)
            .map(|pair| (pair[0].as_str(), pair.get(1).map_or("", String::as_str)))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Body of a write forwarded to the leader: operands only, the receiving
/// route assigns the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedWrite {
    #[serde(default)]
    pub datas: Vec<String>,
}

impl From<&Command> for ForwardedWrite {
    fn from(cmd: &Command) -> Self {
        Self {
            datas: cmd.datas.clone(),
        }
    }
}

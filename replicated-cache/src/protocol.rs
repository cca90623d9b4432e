//! JSON shapes exchanged between nodes and with clients.
//!
//! Field names are part of the compatibility surface with existing nodes and
//! clients, so they are spelled out explicitly rather than derived.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

pub const STATUS_OK: u16 = 200;

/// Routes a node exposes to clients and peers.
pub mod routes {
    pub const GET: &str = "/get";
    pub const KEYS: &str = "/keys";
    pub const SET: &str = "/set";
    pub const DEL: &str = "/del";
    pub const JOIN: &str = "/join";
    pub const CLUSTER: &str = "/cluster";
}

/// Sent by a node that wants to become a voting member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Externally reachable service address of the joining node.
    #[serde(rename = "http")]
    pub http_addr: String,
    /// Replication address, also the node's consensus identity.
    #[serde(rename = "raft")]
    pub raft_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResult {
    pub retcode: u16,
    #[serde(default)]
    pub retdesc: String,
    /// Full membership mapping on success: raft address to service address.
    #[serde(default)]
    pub datas: HashMap<String, String>,
}

impl JoinResult {
    pub fn ok(datas: HashMap<String, String>) -> Self {
        Self {
            retcode: STATUS_OK,
            retdesc: String::new(),
            datas,
        }
    }

    pub fn error(err: &CacheError) -> Self {
        Self {
            retcode: err.status_code(),
            retdesc: err.to_string(),
            datas: HashMap::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.retcode == STATUS_OK
    }
}

/// Reply envelope for get/keys/set/del.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpReply {
    pub retcode: u16,
    #[serde(default)]
    pub retdesc: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl HttpReply {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            retcode: STATUS_OK,
            retdesc: String::new(),
            data,
        }
    }

    pub fn error(err: &CacheError) -> Self {
        Self {
            retcode: err.status_code(),
            retdesc: err.to_string(),
            data: serde_json::Value::Null,
        }
    }
}

//! Node-to-node service calls used for write forwarding and joins.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CacheError, Result};
use crate::protocol::HttpReply;

#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// POSTs `body` to `uri` on the node serving at `addr` and returns the
    /// response body of a successful call.
    async fn post(&self, addr: &str, uri: &str, body: Vec<u8>) -> Result<Vec<u8>>;
}

/// JSON-over-HTTP transport with a fixed per-call timeout.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| CacheError::Network(err.to_string()))?;
        Ok(Self { client })
    }
}

pub fn endpoint(addr: &str, uri: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        format!("{addr}{uri}")
    } else {
        format!("http://{addr}{uri}")
    }
}

#[async_trait]
impl ClusterTransport for HttpTransport {
    async fn post(&self, addr: &str, uri: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let url = endpoint(addr, uri);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| CacheError::Network(err.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| CacheError::Network(err.to_string()))?;

        if status.is_success() {
            return Ok(bytes.to_vec());
        }

        // Error replies carry `{retcode, retdesc}`; keep the remote description.
        let desc = serde_json::from_slice::<HttpReply>(&bytes)
            .map(|reply| reply.retdesc)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
        Err(CacheError::Remote {
            code: status.as_u16(),
            desc,
        })
    }
}

//! Bitcoind adapter.
//!
//! Server mode needs a small capability surface from the full node: fetch a
//! block template, read the chain tip, submit a solved block, and validate
//! the configured payout address. The [`NodeRpc`] trait captures that
//! surface; [`NodeClient`] implements it over bitcoind's JSON-RPC HTTP
//! endpoint with Basic auth.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Capability surface the generator needs from a full node.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Fetch a block template for mining.
    async fn block_template(&self) -> Result<Value>;

    /// Hash of the current chain tip.
    async fn best_block_hash(&self) -> Result<String>;

    /// Current block height.
    async fn block_count(&self) -> Result<u64>;

    /// Block hash at the given height.
    async fn block_hash(&self, height: u64) -> Result<String>;

    /// Submit a solved block; `Ok(false)` means the node rejected it.
    async fn submit_block(&self, hex: &str) -> Result<bool>;

    /// Whether the node considers the address valid.
    async fn validate_address(&self, address: &str) -> Result<bool>;
}

/// JSON-RPC client for one bitcoind endpoint.
pub struct NodeClient {
    http: reqwest::Client,
    url: String,
    auth: String,
    pass: String,
    next_id: AtomicU64,
}

impl NodeClient {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| Error::Node(e.to_string()))?;
        Ok(Self {
            http,
            url: normalize_url(&config.url),
            auth: config.auth.clone(),
            pass: config.pass.clone(),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.auth, Some(&self.pass))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Node(format!("{method} request failed: {e}")))?;
        let val: Value = response
            .json()
            .await
            .map_err(|e| Error::Node(format!("{method} response unreadable: {e}")))?;
        if let Some(err) = val.get("error").filter(|e| !e.is_null()) {
            return Err(Error::Node(format!("{method} failed: {err}")));
        }
        Ok(val.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl NodeRpc for NodeClient {
    async fn block_template(&self) -> Result<Value> {
        self.call("getblocktemplate", json!([{"rules": ["segwit"]}]))
            .await
    }

    async fn best_block_hash(&self) -> Result<String> {
        let result = self.call("getbestblockhash", json!([])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Node("getbestblockhash result not a string".to_string()))
    }

    async fn block_count(&self) -> Result<u64> {
        let result = self.call("getblockcount", json!([])).await?;
        result
            .as_u64()
            .ok_or_else(|| Error::Node("getblockcount result not an integer".to_string()))
    }

    async fn block_hash(&self, height: u64) -> Result<String> {
        let result = self.call("getblockhash", json!([height])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Node("getblockhash result not a string".to_string()))
    }

    async fn submit_block(&self, hex: &str) -> Result<bool> {
        // submitblock returns null on acceptance and a reason string on
        // rejection.
        match self.call("submitblock", json!([hex])).await? {
            Value::Null => Ok(true),
            Value::String(reason) => {
                warn!(%reason, "node rejected submitted block");
                Ok(false)
            }
            other => {
                warn!(result = %other, "unexpected submitblock result");
                Ok(false)
            }
        }
    }

    async fn validate_address(&self, address: &str) -> Result<bool> {
        let result = self.call("validateaddress", json!([address])).await?;
        Ok(result
            .get("isvalid")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }
}

// Node urls are conventionally bare `host:port`; accept a scheme too.
fn normalize_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

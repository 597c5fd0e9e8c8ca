//! Cluster RPC client
//!
//! Fetches vote accounts, gossip-visible nodes and the node identity over
//! JSON-RPC 2.0.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::{QosError, Result};
use crate::types::{ClusterNode, Identity, VoteAccounts};

/// Per-request HTTP timeout
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Source of authoritative cluster state
#[async_trait]
pub trait ClusterRpc: Send + Sync {
    async fn fetch_vote_accounts(&self) -> Result<VoteAccounts>;

    async fn fetch_cluster_nodes(&self) -> Result<Vec<ClusterNode>>;

    async fn fetch_local_identity(&self) -> Result<Identity>;
}

/// JSON-RPC request
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: serde_json::Value,
    id: u64,
}

/// JSON-RPC response
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

/// JSON-RPC error
#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct IdentityResult {
    identity: Identity,
}

/// HTTP JSON-RPC client
pub struct JsonRpcClient {
    url: String,
    client: reqwest::Client,
    request_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| QosError::CollaboratorInit {
                collaborator: "rpc client",
                reason: e.to_string(),
            })?;

        Ok(Self {
            url: url.to_string(),
            client,
            request_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Make a JSON-RPC call
    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        what: &'static str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let fetch_err = |reason: String| QosError::Fetch { what, reason };

        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id(),
        };

        debug!("RPC {} -> {}", method, self.url);

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| fetch_err(format!("network error: {}", e)))?;

        if !response.status().is_success() {
            return Err(fetch_err(format!("HTTP error: {}", response.status())));
        }

        let body: JsonRpcResponse<T> = response
            .json()
            .await
            .map_err(|e| fetch_err(format!("parse error: {}", e)))?;

        decode(body).map_err(fetch_err)
    }
}

fn decode<T>(body: JsonRpcResponse<T>) -> std::result::Result<T, String> {
    if let Some(error) = body.error {
        return Err(format!("RPC error {}: {}", error.code, error.message));
    }
    body.result.ok_or_else(|| "empty response".to_string())
}

#[async_trait]
impl ClusterRpc for JsonRpcClient {
    async fn fetch_vote_accounts(&self) -> Result<VoteAccounts> {
        self.call("vote accounts", "getVoteAccounts", serde_json::json!([]))
            .await
    }

    async fn fetch_cluster_nodes(&self) -> Result<Vec<ClusterNode>> {
        self.call("cluster nodes", "getClusterNodes", serde_json::json!([]))
            .await
    }

    async fn fetch_local_identity(&self) -> Result<Identity> {
        let result: IdentityResult = self
            .call("identity", "getIdentity", serde_json::json!([]))
            .await?;
        Ok(result.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_format() {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method: "getClusterNodes",
            params: serde_json::json!([]),
            id: 7,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["method"], "getClusterNodes");
        assert_eq!(json["id"], 7);
    }

    #[test]
    fn test_decode_result() {
        let body: JsonRpcResponse<IdentityResult> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","result":{"identity":"V1"},"id":1}"#,
        )
        .unwrap();
        assert_eq!(decode(body).unwrap().identity, Identity::new("V1"));
    }

    #[test]
    fn test_decode_error() {
        let body: JsonRpcResponse<VoteAccounts> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","error":{"code":-32005,"message":"Node is behind"},"id":1}"#,
        )
        .unwrap();
        let err = decode(body).unwrap_err();
        assert!(err.contains("Node is behind"));
    }

    #[test]
    fn test_request_ids_increase() {
        let client = JsonRpcClient::new("http://localhost:8899").unwrap();
        assert_eq!(client.next_id(), 1);
        assert_eq!(client.next_id(), 2);
        assert_eq!(client.url, "http://localhost:8899");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_fetch_error() {
        // Port 9 (discard) on localhost is expected to refuse
        let client = JsonRpcClient::new("http://127.0.0.1:9").unwrap();
        let result = client.fetch_cluster_nodes().await;
        assert!(matches!(result, Err(QosError::Fetch { what: "cluster nodes", .. })));
    }
}

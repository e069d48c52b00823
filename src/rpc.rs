//! JSON-RPC client for Ethereum nodes
//!
//! Provides a typed interface to the node methods the cache layer needs.
//! Every response goes through the same envelope handling so callers can
//! tell a transport failure apart from a remote error or a missing entity.

use crate::records::{Block, LogEntry, Receipt, Trace, Transaction};
use crate::types::{
    parse_hex_u64, RpcBlock, RpcData, RpcLog, RpcQuantity, RpcReceipt, RpcTrace, RpcTransaction,
};
use alloy_primitives::{Address, B256, U256};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

/// Failures of a single RPC call. Every variant names the method.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The request never produced a parseable response.
    #[error("{method}: transport failure: {detail}")]
    Transport { method: String, detail: String },

    /// The node answered with an `error` member.
    #[error("{method}: remote error: {error}")]
    Remote { method: String, error: String },

    /// The envelope carried neither `result` nor `error`.
    #[error("{method}: response missing 'result' field")]
    MissingResult { method: String },

    /// `result` was null: the entity does not exist.
    #[error("{method}: not found")]
    NotFound { method: String },

    /// `result` did not have the expected shape.
    #[error("{method}: failed to decode result: {detail}")]
    Decode { method: String, detail: String },
}

impl RpcError {
    /// Whether the node reported the entity as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::NotFound { .. })
    }

    /// Whether the failure happened below the JSON-RPC layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport { .. })
    }
}

/// Sends one JSON-RPC request body and returns the response body.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn send(&self, request: &Value) -> anyhow::Result<Value>;
}

/// HTTP(S) transport.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: &Value) -> anyhow::Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .context("Failed to send RPC request")?;

        response
            .json()
            .await
            .context("Failed to parse RPC response")
    }
}

/// Sync progress reported by `eth_syncing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SyncStatus {
    pub starting_block: u64,
    pub current_block: u64,
    pub highest_block: u64,
}

/// JSON-RPC client for Ethereum nodes.
pub struct RpcClient<T = HttpTransport> {
    transport: T,
    next_id: AtomicU64,
}

impl RpcClient<HttpTransport> {
    /// Create a new HTTP RPC client.
    pub fn http(url: String) -> Self {
        Self::new(HttpTransport::new(url))
    }
}

impl<T: Transport> RpcClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Make a JSON-RPC call and unwrap its `result`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        debug!(method, id, "rpc call");

        let mut response = self
            .transport
            .send(&request)
            .await
            .map_err(|e| RpcError::Transport {
                method: method.to_string(),
                detail: format!("{:#}", e),
            })?;

        // Check for RPC error
        if let Some(error) = response.get("error") {
            return Err(RpcError::Remote {
                method: method.to_string(),
                error: error.to_string(),
            });
        }

        // Extract result
        match response.get_mut("result") {
            Some(result) => Ok(result.take()),
            None => Err(RpcError::MissingResult {
                method: method.to_string(),
            }),
        }
    }

    /// Call and decode a non-null result.
    async fn call_as<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R, RpcError> {
        let result = self.call(method, params).await?;
        if result.is_null() {
            return Err(RpcError::NotFound {
                method: method.to_string(),
            });
        }
        serde_json::from_value(result).map_err(|e| RpcError::Decode {
            method: method.to_string(),
            detail: e.to_string(),
        })
    }

    /// Get a block by number with full transaction objects.
    pub async fn get_block_by_number(&self, num: u64) -> Result<Block, RpcError> {
        let params = json!([format!("0x{:x}", num), true]);
        let block: RpcBlock = self.call_as("eth_getBlockByNumber", params).await?;
        Ok(block.into())
    }

    /// Get a block by hash with full transaction objects.
    pub async fn get_block_by_hash(&self, hash: B256) -> Result<Block, RpcError> {
        let params = json!([format!("0x{:x}", hash), true]);
        let block: RpcBlock = self.call_as("eth_getBlockByHash", params).await?;
        Ok(block.into())
    }

    /// Get a transaction by hash.
    pub async fn get_transaction_by_hash(&self, hash: B256) -> Result<Transaction, RpcError> {
        let params = json!([format!("0x{:x}", hash)]);
        let tx: RpcTransaction = self.call_as("eth_getTransactionByHash", params).await?;
        Ok(tx.into())
    }

    /// Get a transaction by block hash and position.
    pub async fn get_transaction_by_block_hash_and_index(
        &self,
        block_hash: B256,
        index: u64,
    ) -> Result<Transaction, RpcError> {
        let params = json!([format!("0x{:x}", block_hash), format!("0x{:x}", index)]);
        let tx: RpcTransaction = self
            .call_as("eth_getTransactionByBlockHashAndIndex", params)
            .await?;
        Ok(tx.into())
    }

    /// Get a transaction by block number and position.
    pub async fn get_transaction_by_block_number_and_index(
        &self,
        block: u64,
        index: u64,
    ) -> Result<Transaction, RpcError> {
        let params = json!([format!("0x{:x}", block), format!("0x{:x}", index)]);
        let tx: RpcTransaction = self
            .call_as("eth_getTransactionByBlockNumberAndIndex", params)
            .await?;
        Ok(tx.into())
    }

    /// Get a transaction receipt by hash.
    pub async fn get_transaction_receipt(&self, tx_hash: B256) -> Result<Receipt, RpcError> {
        let params = json!([format!("0x{:x}", tx_hash)]);
        let receipt: RpcReceipt = self.call_as("eth_getTransactionReceipt", params).await?;
        Ok(receipt.into())
    }

    /// Get every trace of a transaction.
    ///
    /// The array is consumed element by element; an element that does not
    /// parse as a trace is skipped rather than failing the whole response.
    pub async fn get_traces(&self, tx_hash: B256) -> Result<Vec<Trace>, RpcError> {
        let method = "trace_transaction";
        let result = self
            .call(method, json!([format!("0x{:x}", tx_hash)]))
            .await?;

        let items = match result {
            Value::Null => return Ok(Vec::new()),
            Value::Array(items) => items,
            other => {
                return Err(RpcError::Decode {
                    method: method.to_string(),
                    detail: format!("expected array, got {}", other),
                })
            }
        };

        let mut traces = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            match serde_json::from_value::<RpcTrace>(item) {
                Ok(trace) => traces.push(trace.into()),
                Err(e) => debug!(tx = %tx_hash, position = i, error = %e, "skipping unparseable trace"),
            }
        }
        Ok(traces)
    }

    /// Whether the transaction has a trace at `offset`.
    pub async fn has_trace_at(&self, tx_hash: B256, offset: u64) -> Result<bool, RpcError> {
        let params = json!([format!("0x{:x}", tx_hash), [format!("0x{:x}", offset)]]);
        match self.call("trace_get", params).await {
            Ok(result) => Ok(result.get("blockNumber").is_some()),
            Err(e) if e.is_transport() => Err(e),
            // Nodes answer out-of-range offsets with null or an error
            Err(_) => Ok(false),
        }
    }

    /// Get logs emitted by `address` in `[from_block, to_block]`.
    pub async fn get_logs(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>, RpcError> {
        let params = json!([{
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", to_block),
            "address": format!("0x{:x}", address),
        }]);
        let logs: Vec<RpcLog> = self.call_as("eth_getLogs", params).await?;
        Ok(logs.into_iter().map(LogEntry::from).collect())
    }

    /// Accounts managed by the node.
    pub async fn accounts(&self) -> Result<Vec<Address>, RpcError> {
        self.call_as("eth_accounts", json!([])).await
    }

    /// Latest block number the node reports.
    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let method = "eth_blockNumber";
        let result: String = self.call_as(method, json!([])).await?;
        parse_hex_u64(&result).map_err(|e| RpcError::Decode {
            method: method.to_string(),
            detail: e.to_string(),
        })
    }

    /// Sync progress, or None when the node is not syncing.
    pub async fn syncing(&self) -> Result<Option<SyncStatus>, RpcError> {
        let method = "eth_syncing";
        let result = self.call(method, json!([])).await?;
        if !result.is_object() {
            // `false` when fully synced
            return Ok(None);
        }

        let field = |name: &str| -> Result<u64, RpcError> {
            let s = result.get(name).and_then(|v| v.as_str()).unwrap_or("0x0");
            parse_hex_u64(s).map_err(|e| RpcError::Decode {
                method: method.to_string(),
                detail: format!("{}: {}", name, e),
            })
        };
        Ok(Some(SyncStatus {
            starting_block: field("startingBlock")?,
            current_block: field("currentBlock")?,
            highest_block: field("highestBlock")?,
        }))
    }

    /// Latest block the node knows of.
    ///
    /// Some clients report 0 from `eth_blockNumber` until fully synced; in
    /// that case the current block from `eth_syncing` is used instead.
    pub async fn latest_block(&self) -> Result<u64, RpcError> {
        let latest = self.block_number().await?;
        if latest != 0 {
            return Ok(latest);
        }
        debug!("eth_blockNumber reported 0, falling back to eth_syncing");
        Ok(self.syncing().await?.map(|s| s.current_block).unwrap_or(0))
    }

    /// Balance of `address` as of block `block`.
    ///
    /// Nodes without historical state answer for old blocks with an error.
    pub async fn get_balance(&self, address: Address, block: u64) -> Result<U256, RpcError> {
        let params = json!([format!("0x{:x}", address), format!("0x{:x}", block)]);
        let balance: RpcQuantity = self.call_as("eth_getBalance", params).await?;
        Ok(balance.0)
    }

    /// Deployed code of `address` at the latest block. Empty for accounts
    /// without code.
    pub async fn get_code(&self, address: Address) -> Result<Vec<u8>, RpcError> {
        let params = json!([format!("0x{:x}", address), "latest"]);
        let code: RpcData = self.call_as("eth_getCode", params).await?;
        Ok(code.0)
    }

    /// Client version string.
    pub async fn client_version(&self) -> Result<String, RpcError> {
        self.call_as("web3_clientVersion", json!([])).await
    }

    /// Keccak-256 of hex-encoded data, computed by the node.
    pub async fn sha3(&self, data: &[u8]) -> Result<B256, RpcError> {
        let params = json!([format!("0x{}", hex::encode(data))]);
        self.call_as("web3_sha3", params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{address, hash, MockNode};

    #[tokio::test]
    async fn test_envelope_errors_are_distinct() {
        let node = MockNode::new();
        node.respond_raw("web3_clientVersion", json!({"jsonrpc": "2.0", "id": 1}));
        node.respond_raw(
            "eth_accounts",
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "nope"}}),
        );
        node.fail_transport("eth_blockNumber");
        let rpc = RpcClient::new(node);

        match rpc.client_version().await {
            Err(RpcError::MissingResult { method }) => assert_eq!(method, "web3_clientVersion"),
            other => panic!("expected missing result, got {:?}", other),
        }
        match rpc.accounts().await {
            Err(RpcError::Remote { method, error }) => {
                assert_eq!(method, "eth_accounts");
                assert!(error.contains("nope"));
            }
            other => panic!("expected remote error, got {:?}", other),
        }
        let err = rpc.block_number().await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_missing_entity_is_not_found() {
        let rpc = RpcClient::new(MockNode::new());
        let err = rpc.get_transaction_by_hash(hash(9)).await.unwrap_err();
        assert!(err.is_not_found());
        let err = rpc.get_block_by_number(5).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_block_by_number() {
        let node = MockNode::new();
        node.add_block(100, 2);
        let rpc = RpcClient::new(node);

        let block = rpc.get_block_by_number(100).await.unwrap();
        assert_eq!(block.number, 100);
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(block.transactions[1].transaction_index, 1);
        assert_eq!(rpc.transport().calls("eth_getBlockByNumber"), 1);
    }

    #[tokio::test]
    async fn test_traces_skip_malformed_elements() {
        let node = MockNode::new();
        let tx = hash(0x42);
        node.add_traces(tx, 3, None);
        node.push_raw_trace(tx, json!({"garbage": true}));
        let rpc = RpcClient::new(node);

        let traces = rpc.get_traces(tx).await.unwrap();
        assert_eq!(traces.len(), 3);
        assert!(traces[0].is_top_level());
        assert_eq!(traces[2].trace_address, vec![1]);
    }

    #[tokio::test]
    async fn test_has_trace_at() {
        let node = MockNode::new();
        let tx = hash(0x43);
        node.add_traces(tx, 2, None);
        let rpc = RpcClient::new(node);

        assert!(rpc.has_trace_at(tx, 0).await.unwrap());
        assert!(rpc.has_trace_at(tx, 1).await.unwrap());
        assert!(!rpc.has_trace_at(tx, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_balance_and_code() {
        let node = MockNode::new();
        let contract = address(0x77);
        node.set_balance(contract, 1_500_001, U256::from(0x3a8b7u64));
        node.set_code(contract, vec![0x60, 0x80, 0x60, 0x40]);
        let rpc = RpcClient::new(node);

        assert_eq!(rpc.get_balance(contract, 1_500_001).await.unwrap(), U256::from(0x3a8b7u64));
        assert_eq!(rpc.get_balance(contract, 1_500_000).await.unwrap(), U256::ZERO);
        assert_eq!(rpc.get_code(contract).await.unwrap(), vec![0x60, 0x80, 0x60, 0x40]);
        assert!(rpc.get_code(address(0x78)).await.unwrap().is_empty());

        // Odd-length quantities are accepted
        let node = MockNode::new();
        node.respond("eth_getBalance", json!("0xabc"));
        let rpc = RpcClient::new(node);
        assert_eq!(rpc.get_balance(contract, 1).await.unwrap(), U256::from(0xabcu64));
    }

    #[tokio::test]
    async fn test_latest_block_falls_back_to_syncing() {
        let node = MockNode::new();
        node.respond("eth_blockNumber", json!("0x0"));
        node.respond(
            "eth_syncing",
            json!({"startingBlock": "0x0", "currentBlock": "0x3e8", "highestBlock": "0x7d0"}),
        );
        let rpc = RpcClient::new(node);
        assert_eq!(rpc.latest_block().await.unwrap(), 1000);

        let node = MockNode::new();
        node.respond("eth_blockNumber", json!("0x10"));
        node.respond("eth_syncing", json!(false));
        let rpc = RpcClient::new(node);
        assert_eq!(rpc.latest_block().await.unwrap(), 16);
        assert_eq!(rpc.syncing().await.unwrap(), None);
    }
}

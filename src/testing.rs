//! Test fixtures: sample records and an in-memory node behind `Transport`.

use crate::config::NodeConfig;
use crate::lock::LockRegistry;
use crate::node::{Provider, Session};
use crate::records::{Block, LogEntry, Receipt, Transaction};
use crate::rpc::Transport;
use alloy_primitives::{keccak256, Address, BloomInput, B256, U256};
use anyhow::bail;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// Session over a fresh `MockNode` with its cache in a temp dir.
pub fn test_session(provider: Provider) -> (Session<MockNode>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = NodeConfig {
        cache_root: temp_dir.path().join("cache"),
        provider,
        lock_wait: Duration::from_millis(100),
        ..Default::default()
    };
    let session =
        Session::with_transports(config, MockNode::new(), None, LockRegistry::new()).unwrap();
    (session, temp_dir)
}

/// The node behind a test session.
pub fn mock(session: &Session<MockNode>) -> &MockNode {
    session.client(Provider::Local).transport()
}

/// Arbitrary 32-byte value derived from `k`.
pub fn hash(k: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&k.to_be_bytes());
    B256::from(bytes)
}

pub fn block_hash(number: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xbb;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(bytes)
}

pub fn tx_hash(number: u64, index: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xaa;
    bytes[8..16].copy_from_slice(&number.to_be_bytes());
    bytes[24..].copy_from_slice(&index.to_be_bytes());
    B256::from(bytes)
}

pub fn address(k: u8) -> Address {
    Address::repeat_byte(k)
}

/// A block with `n_txs` transactions, each carrying a successful receipt with
/// one log. The logs bloom covers every log address and topic.
pub fn sample_block(number: u64, n_txs: usize) -> Block {
    let hash = block_hash(number);
    let mut block = Block {
        number,
        hash,
        parent_hash: block_hash(number.wrapping_sub(1)),
        timestamp: 1_438_269_988 + number * 13,
        gas_limit: 30_000_000,
        gas_used: 21_000 * n_txs as u64,
        miner: address(0x11),
        ..Default::default()
    };

    for i in 0..n_txs as u64 {
        let log = LogEntry {
            address: address(0x30 + (i % 4) as u8),
            log_index: i,
            topics: vec![hash_topic(i)],
            data: vec![i as u8; 4],
        };
        block.logs_bloom.accrue(BloomInput::Raw(log.address.as_slice()));
        for topic in &log.topics {
            block.logs_bloom.accrue(BloomInput::Raw(topic.as_slice()));
        }

        block.transactions.push(Transaction {
            hash: tx_hash(number, i),
            block_hash: hash,
            block_number: number,
            transaction_index: i,
            nonce: i,
            from: address(0x22),
            // Every fifth transaction creates a contract
            to: if i % 5 == 4 { None } else { Some(address(0x33)) },
            value: U256::from(1_000u64 * (i + 1)),
            gas: 50_000,
            gas_price: U256::from(20_000_000_000u64),
            input: vec![0xde, 0xad, i as u8],
            is_error: false,
            receipt: Receipt {
                status: Some(1),
                gas_used: 21_000,
                contract_address: None,
                logs: vec![log],
            },
        });
    }
    block
}

fn hash_topic(i: u64) -> B256 {
    let mut bytes = [0x44u8; 32];
    bytes[24..].copy_from_slice(&i.to_be_bytes());
    B256::from(bytes)
}

fn hex_bytes(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn tx_json(tx: &Transaction) -> Value {
    json!({
        "hash": format!("0x{:x}", tx.hash),
        "blockHash": format!("0x{:x}", tx.block_hash),
        "blockNumber": format!("0x{:x}", tx.block_number),
        "transactionIndex": format!("0x{:x}", tx.transaction_index),
        "nonce": format!("0x{:x}", tx.nonce),
        "from": format!("0x{:x}", tx.from),
        "to": tx.to.map(|to| format!("0x{:x}", to)),
        "value": format!("0x{:x}", tx.value),
        "gas": format!("0x{:x}", tx.gas),
        "gasPrice": format!("0x{:x}", tx.gas_price),
        "input": hex_bytes(&tx.input),
    })
}

fn log_json(log: &LogEntry) -> Value {
    json!({
        "address": format!("0x{:x}", log.address),
        "logIndex": format!("0x{:x}", log.log_index),
        "topics": log.topics.iter().map(|t| format!("0x{:x}", t)).collect::<Vec<_>>(),
        "data": hex_bytes(&log.data),
    })
}

fn receipt_json(receipt: &Receipt) -> Value {
    let mut value = json!({
        "gasUsed": format!("0x{:x}", receipt.gas_used),
        "contractAddress": receipt.contract_address.map(|a| format!("0x{:x}", a)),
        "logs": receipt.logs.iter().map(log_json).collect::<Vec<_>>(),
    });
    if let Some(status) = receipt.status {
        value["status"] = json!(format!("0x{:x}", status));
    }
    value
}

fn block_json(block: &Block) -> Value {
    json!({
        "number": format!("0x{:x}", block.number),
        "hash": format!("0x{:x}", block.hash),
        "parentHash": format!("0x{:x}", block.parent_hash),
        "timestamp": format!("0x{:x}", block.timestamp),
        "gasLimit": format!("0x{:x}", block.gas_limit),
        "gasUsed": format!("0x{:x}", block.gas_used),
        "miner": format!("0x{:x}", block.miner),
        "logsBloom": hex_bytes(block.logs_bloom.as_slice()),
        "transactions": block.transactions.iter().map(tx_json).collect::<Vec<_>>(),
    })
}

fn trace_json(tx: B256, block: u64, position: u64, offset: usize, error: Option<&str>) -> Value {
    let trace_address: Vec<u64> = if offset == 0 { vec![] } else { vec![offset as u64 - 1] };
    let mut value = json!({
        "action": {
            "callType": "call",
            "from": format!("0x{:x}", address(0x55)),
            "to": format!("0x{:x}", address(0x66)),
            "gas": "0x1d8a8",
            "input": "0x",
            "value": "0x0"
        },
        "blockHash": format!("0x{:x}", block_hash(block)),
        "blockNumber": block,
        "result": { "gasUsed": "0x0", "output": "0x" },
        "subtraces": 0,
        "traceAddress": trace_address,
        "transactionHash": format!("0x{:x}", tx),
        "transactionPosition": position,
        "type": "call"
    });
    if offset == 0 {
        if let Some(error) = error {
            value["error"] = json!(error);
        }
    }
    value
}

#[derive(Default)]
struct MockState {
    blocks: BTreeMap<u64, Block>,
    receipts: HashMap<B256, Receipt>,
    traces: HashMap<B256, Vec<Value>>,
    balances: HashMap<(Address, u64), U256>,
    code: HashMap<Address, Vec<u8>>,
    canned: HashMap<String, Value>,
    failing: HashSet<String>,
    calls: Vec<String>,
}

/// In-memory node answering JSON-RPC requests from registered blocks,
/// receipts and traces. Unknown entities come back as `null`.
#[derive(Default)]
pub struct MockNode {
    state: Mutex<MockState>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Register `sample_block(number, n_txs)` with its receipts; returns it.
    pub fn add_block(&self, number: u64, n_txs: usize) -> Block {
        let block = sample_block(number, n_txs);
        self.insert_block(block.clone());
        block
    }

    /// Register an arbitrary block with the receipts its transactions carry.
    pub fn insert_block(&self, block: Block) {
        let mut state = self.state();
        for tx in &block.transactions {
            state.receipts.insert(tx.hash, tx.receipt.clone());
        }
        state.blocks.insert(block.number, block);
    }

    /// Replace the receipt of a registered transaction.
    pub fn set_receipt(&self, tx: B256, receipt: Receipt) {
        self.state().receipts.insert(tx, receipt);
    }

    /// Register `n` traces for `tx`; the top-level one carries `error`.
    pub fn add_traces(&self, tx: B256, n: usize, error: Option<&str>) {
        let mut state = self.state();
        let (block, position) = state
            .blocks
            .values()
            .flat_map(|b| b.transactions.iter())
            .find(|t| t.hash == tx)
            .map(|t| (t.block_number, t.transaction_index))
            .unwrap_or((0, 0));
        let traces = (0..n).map(|i| trace_json(tx, block, position, i, error)).collect();
        state.traces.insert(tx, traces);
    }

    /// Balance `address` reports at `block`; unset balances read as zero.
    pub fn set_balance(&self, address: Address, block: u64, balance: U256) {
        self.state().balances.insert((address, block), balance);
    }

    pub fn set_code(&self, address: Address, code: Vec<u8>) {
        self.state().code.insert(address, code);
    }

    /// Append a raw element to the trace array of `tx`.
    pub fn push_raw_trace(&self, tx: B256, trace: Value) {
        self.state().traces.entry(tx).or_default().push(trace);
    }

    /// Answer `method` with `result` regardless of parameters.
    pub fn respond(&self, method: &str, result: Value) {
        self.respond_raw(method, json!({"jsonrpc": "2.0", "id": 1, "result": result}));
    }

    /// Answer `method` with a full response envelope.
    pub fn respond_raw(&self, method: &str, envelope: Value) {
        self.state().canned.insert(method.to_string(), envelope);
    }

    /// Make `method` fail below the JSON-RPC layer.
    pub fn fail_transport(&self, method: &str) {
        self.state().failing.insert(method.to_string());
    }

    /// Number of calls made to `method`.
    pub fn calls(&self, method: &str) -> usize {
        self.state().calls.iter().filter(|m| *m == method).count()
    }

    /// Total number of calls made.
    pub fn total_calls(&self) -> usize {
        self.state().calls.len()
    }

    fn answer(state: &MockState, method: &str, params: &[Value]) -> Result<Value, String> {
        let param_u64 = |i: usize| -> Result<u64, String> {
            let s = params.get(i).and_then(|v| v.as_str()).ok_or("missing param")?;
            crate::types::parse_hex_u64(s).map_err(|e| e.to_string())
        };
        let param_hash = |i: usize| -> Result<B256, String> {
            let s = params.get(i).and_then(|v| v.as_str()).ok_or("missing param")?;
            s.parse::<B256>().map_err(|e| e.to_string())
        };
        let find_tx = |hash: B256| {
            state
                .blocks
                .values()
                .flat_map(|b| b.transactions.iter())
                .find(|t| t.hash == hash)
        };
        let by_hash = |hash: B256| state.blocks.values().find(|b| b.hash == hash);

        let result = match method {
            "eth_getBlockByNumber" => state
                .blocks
                .get(&param_u64(0)?)
                .map(block_json)
                .unwrap_or(Value::Null),
            "eth_getBlockByHash" => by_hash(param_hash(0)?).map(block_json).unwrap_or(Value::Null),
            "eth_getTransactionByHash" => find_tx(param_hash(0)?).map(tx_json).unwrap_or(Value::Null),
            "eth_getTransactionByBlockHashAndIndex" => by_hash(param_hash(0)?)
                .and_then(|b| b.transaction(param_u64(1).ok()?))
                .map(tx_json)
                .unwrap_or(Value::Null),
            "eth_getTransactionByBlockNumberAndIndex" => state
                .blocks
                .get(&param_u64(0)?)
                .and_then(|b| b.transaction(param_u64(1).ok()?))
                .map(tx_json)
                .unwrap_or(Value::Null),
            "eth_getTransactionReceipt" => state
                .receipts
                .get(&param_hash(0)?)
                .map(receipt_json)
                .unwrap_or(Value::Null),
            "trace_transaction" => state
                .traces
                .get(&param_hash(0)?)
                .map(|t| Value::Array(t.clone()))
                .unwrap_or(Value::Null),
            "trace_get" => {
                let offset = params
                    .get(1)
                    .and_then(|v| v.get(0))
                    .and_then(|v| v.as_str())
                    .ok_or("missing offset")?;
                let offset = crate::types::parse_hex_u64(offset).map_err(|e| e.to_string())?;
                state
                    .traces
                    .get(&param_hash(0)?)
                    .and_then(|t| t.get(offset as usize))
                    .cloned()
                    .unwrap_or(Value::Null)
            }
            "eth_getLogs" => {
                let filter = params.first().ok_or("missing filter")?;
                let field = |name: &str| {
                    filter
                        .get(name)
                        .and_then(|v| v.as_str())
                        .map(String::from)
                        .ok_or(format!("missing {}", name))
                };
                let from = crate::types::parse_hex_u64(&field("fromBlock")?).map_err(|e| e.to_string())?;
                let to = crate::types::parse_hex_u64(&field("toBlock")?).map_err(|e| e.to_string())?;
                let address: Address = field("address")?.parse().map_err(|e| format!("{}", e))?;
                if from > to {
                    return Ok(json!([]));
                }
                let logs: Vec<Value> = state
                    .blocks
                    .range(from..=to)
                    .flat_map(|(_, b)| b.transactions.iter())
                    .filter_map(|t| state.receipts.get(&t.hash))
                    .flat_map(|r| r.logs.iter())
                    .filter(|l| l.address == address)
                    .map(log_json)
                    .collect();
                Value::Array(logs)
            }
            "eth_blockNumber" => {
                let latest = state.blocks.keys().next_back().copied().unwrap_or(0);
                json!(format!("0x{:x}", latest))
            }
            "eth_getBalance" => {
                let account: Address = params
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or("missing address")?
                    .parse()
                    .map_err(|e| format!("{}", e))?;
                let balance = state
                    .balances
                    .get(&(account, param_u64(1)?))
                    .copied()
                    .unwrap_or(U256::ZERO);
                json!(format!("0x{:x}", balance))
            }
            "eth_getCode" => {
                let account: Address = params
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or("missing address")?
                    .parse()
                    .map_err(|e| format!("{}", e))?;
                json!(hex_bytes(state.code.get(&account).map(Vec::as_slice).unwrap_or_default()))
            }
            "eth_syncing" => json!(false),
            "eth_accounts" => json!([format!("0x{:x}", address(0x22))]),
            "web3_clientVersion" => json!("MockNode/v1.0.0"),
            "web3_sha3" => {
                let data = params.first().and_then(|v| v.as_str()).ok_or("missing data")?;
                let bytes = hex::decode(data.trim_start_matches("0x")).map_err(|e| e.to_string())?;
                json!(format!("0x{:x}", keccak256(bytes)))
            }
            other => return Err(format!("the method {} does not exist", other)),
        };
        Ok(result)
    }
}

impl Transport for MockNode {
    async fn send(&self, request: &Value) -> anyhow::Result<Value> {
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let id = request["id"].clone();
        let params = request["params"].as_array().cloned().unwrap_or_default();

        let mut state = self.state();
        state.calls.push(method.clone());
        if state.failing.contains(&method) {
            bail!("connection refused");
        }
        if let Some(envelope) = state.canned.get(&method) {
            return Ok(envelope.clone());
        }

        Ok(match Self::answer(&state, &method, &params) {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err(message) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": message}
            }),
        })
    }
}

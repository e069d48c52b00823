//! Ethereum JSON-RPC wire types
//!
//! Type definitions for blocks, transactions, receipts, logs and traces as
//! returned from Ethereum JSON-RPC endpoints, converted into `records` once
//! parsed. Conversions run the per-entity finishing step (transactions inherit
//! their block's identity).

use crate::records::{Block, LogEntry, Receipt, Trace, TraceAction, TraceResult, Transaction};
use alloy_primitives::{Address, Bloom, B256, U256};
use serde::{Deserialize, Deserializer};

/// Block as returned by `eth_getBlockByNumber` / `eth_getBlockByHash` with
/// full transaction objects.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlock {
    #[serde(rename = "number", deserialize_with = "deserialize_hex_u64")]
    pub number: u64,

    #[serde(rename = "hash", deserialize_with = "deserialize_hex_b256")]
    pub hash: B256,

    #[serde(rename = "parentHash", default, deserialize_with = "deserialize_hex_b256_opt")]
    pub parent_hash: Option<B256>,

    #[serde(rename = "timestamp", deserialize_with = "deserialize_hex_u64")]
    pub timestamp: u64,

    #[serde(rename = "gasLimit", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub gas_limit: Option<u64>,

    #[serde(rename = "gasUsed", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub gas_used: Option<u64>,

    #[serde(rename = "miner", default, deserialize_with = "deserialize_hex_address_opt")]
    pub miner: Option<Address>,

    /// 256-byte logs bloom (hex string in JSON)
    #[serde(rename = "logsBloom", default, deserialize_with = "deserialize_hex_bloom")]
    pub logs_bloom: Bloom,

    #[serde(rename = "transactions", default)]
    pub transactions: Vec<RpcTransaction>,
}

/// Transaction object.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcTransaction {
    #[serde(rename = "hash", deserialize_with = "deserialize_hex_b256")]
    pub hash: B256,

    #[serde(rename = "blockHash", default, deserialize_with = "deserialize_hex_b256_opt")]
    pub block_hash: Option<B256>,

    #[serde(rename = "blockNumber", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub block_number: Option<u64>,

    #[serde(rename = "transactionIndex", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub transaction_index: Option<u64>,

    #[serde(rename = "from", deserialize_with = "deserialize_hex_address")]
    pub from: Address,

    /// Recipient address (None for contract creation)
    #[serde(rename = "to", default, deserialize_with = "deserialize_hex_address_opt")]
    pub to: Option<Address>,

    #[serde(rename = "value", deserialize_with = "deserialize_hex_u256")]
    pub value: U256,

    #[serde(rename = "gas", deserialize_with = "deserialize_hex_u64")]
    pub gas: u64,

    #[serde(rename = "gasPrice", default, deserialize_with = "deserialize_hex_u256_opt")]
    pub gas_price: Option<U256>,

    #[serde(rename = "input", default, deserialize_with = "deserialize_hex_bytes")]
    pub input: Vec<u8>,

    #[serde(rename = "nonce", deserialize_with = "deserialize_hex_u64")]
    pub nonce: u64,
}

/// Log entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcLog {
    #[serde(rename = "address", deserialize_with = "deserialize_hex_address")]
    pub address: Address,

    #[serde(rename = "logIndex", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub log_index: Option<u64>,

    #[serde(rename = "topics", default)]
    pub topics: Vec<B256>,

    #[serde(rename = "data", default, deserialize_with = "deserialize_hex_bytes")]
    pub data: Vec<u8>,
}

/// Transaction receipt.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcReceipt {
    /// Only present at and after the status fork
    #[serde(rename = "status", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub status: Option<u64>,

    #[serde(rename = "gasUsed", deserialize_with = "deserialize_hex_u64")]
    pub gas_used: u64,

    #[serde(rename = "contractAddress", default, deserialize_with = "deserialize_hex_address_opt")]
    pub contract_address: Option<Address>,

    #[serde(rename = "logs", default)]
    pub logs: Vec<RpcLog>,
}

/// One element of a `trace_transaction` response (parity trace format).
#[derive(Debug, Clone, Deserialize)]
pub struct RpcTrace {
    #[serde(rename = "blockHash", deserialize_with = "deserialize_hex_b256")]
    pub block_hash: B256,

    #[serde(rename = "blockNumber")]
    pub block_number: u64,

    #[serde(rename = "transactionHash", deserialize_with = "deserialize_hex_b256")]
    pub transaction_hash: B256,

    #[serde(rename = "transactionPosition", default)]
    pub transaction_position: u64,

    #[serde(rename = "traceAddress", default)]
    pub trace_address: Vec<u64>,

    #[serde(rename = "subtraces", default)]
    pub subtraces: u64,

    #[serde(rename = "type")]
    pub r#type: String,

    #[serde(default)]
    pub error: Option<String>,

    pub action: RpcTraceAction,

    #[serde(default)]
    pub result: Option<RpcTraceResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcTraceAction {
    #[serde(rename = "callType", default)]
    pub call_type: Option<String>,

    #[serde(default, deserialize_with = "deserialize_hex_address_opt")]
    pub from: Option<Address>,

    #[serde(default, deserialize_with = "deserialize_hex_address_opt")]
    pub to: Option<Address>,

    #[serde(default, deserialize_with = "deserialize_hex_u64_opt")]
    pub gas: Option<u64>,

    /// `input` for calls, `init` for creates
    #[serde(default, alias = "init", deserialize_with = "deserialize_hex_bytes")]
    pub input: Vec<u8>,

    /// Missing or empty values are treated as zero.
    #[serde(default, deserialize_with = "deserialize_hex_u256_lenient")]
    pub value: U256,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcTraceResult {
    #[serde(rename = "gasUsed", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub gas_used: Option<u64>,

    /// `output` for calls, `code` for creates
    #[serde(default, alias = "code", deserialize_with = "deserialize_hex_bytes")]
    pub output: Vec<u8>,

    #[serde(default, deserialize_with = "deserialize_hex_address_opt")]
    pub address: Option<Address>,
}

// Conversions into records

impl From<RpcBlock> for Block {
    fn from(b: RpcBlock) -> Self {
        let transactions = b
            .transactions
            .into_iter()
            .enumerate()
            .map(|(i, tx)| {
                let mut tx = Transaction::from(tx);
                // The block is authoritative for its transactions' identity.
                tx.block_number = b.number;
                tx.block_hash = b.hash;
                tx.transaction_index = i as u64;
                tx
            })
            .collect();
        Block {
            number: b.number,
            hash: b.hash,
            parent_hash: b.parent_hash.unwrap_or_default(),
            timestamp: b.timestamp,
            gas_limit: b.gas_limit.unwrap_or_default(),
            gas_used: b.gas_used.unwrap_or_default(),
            miner: b.miner.unwrap_or_default(),
            logs_bloom: b.logs_bloom,
            transactions,
        }
    }
}

impl From<RpcTransaction> for Transaction {
    fn from(tx: RpcTransaction) -> Self {
        Transaction {
            hash: tx.hash,
            block_hash: tx.block_hash.unwrap_or_default(),
            block_number: tx.block_number.unwrap_or_default(),
            transaction_index: tx.transaction_index.unwrap_or_default(),
            nonce: tx.nonce,
            from: tx.from,
            to: tx.to,
            value: tx.value,
            gas: tx.gas,
            gas_price: tx.gas_price.unwrap_or_default(),
            input: tx.input,
            is_error: false,
            receipt: Receipt::default(),
        }
    }
}

impl From<RpcLog> for LogEntry {
    fn from(log: RpcLog) -> Self {
        LogEntry {
            address: log.address,
            log_index: log.log_index.unwrap_or_default(),
            topics: log.topics,
            data: log.data,
        }
    }
}

impl From<RpcReceipt> for Receipt {
    fn from(r: RpcReceipt) -> Self {
        Receipt {
            status: r.status,
            gas_used: r.gas_used,
            contract_address: r.contract_address,
            logs: r.logs.into_iter().map(LogEntry::from).collect(),
        }
    }
}

impl From<RpcTrace> for Trace {
    fn from(t: RpcTrace) -> Self {
        Trace {
            block_hash: t.block_hash,
            block_number: t.block_number,
            transaction_hash: t.transaction_hash,
            transaction_position: t.transaction_position,
            trace_address: t.trace_address,
            subtraces: t.subtraces,
            trace_type: t.r#type,
            error: t.error,
            action: TraceAction {
                call_type: t.action.call_type,
                from: t.action.from,
                to: t.action.to,
                gas: t.action.gas.unwrap_or_default(),
                input: t.action.input,
                value: t.action.value,
            },
            result: t.result.map(|r| TraceResult {
                gas_used: r.gas_used.unwrap_or_default(),
                output: r.output,
                address: r.address,
            }),
        }
    }
}

/// Hex quantity such as an `eth_getBalance` result.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcQuantity(#[serde(deserialize_with = "deserialize_hex_u256")] pub U256);

/// Hex data such as an `eth_getCode` result.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcData(#[serde(deserialize_with = "deserialize_hex_bytes")] pub Vec<u8>);

// Hex deserialization helpers

/// Pad an odd-length hex string with a leading zero.
/// This handles cases where RPC returns hex strings without leading zeros.
pub(crate) fn pad_hex_string(s: &str) -> String {
    if s.is_empty() {
        return s.to_string();
    }
    if s.len() % 2 == 1 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

/// Parse a `0x`-prefixed quantity into u64. Empty means zero.
pub(crate) fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(s, 16)
}

fn decode_fixed<E: serde::de::Error>(s: &str, len: usize, what: &str) -> Result<Vec<u8>, E> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s).map_err(E::custom)?;
    if bytes.len() != len {
        return Err(E::custom(format!(
            "Expected {} bytes for {}, got {}",
            len,
            what,
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn decode_u256<E: serde::de::Error>(s: &str) -> Result<U256, E> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::ZERO);
    }
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s).map_err(E::custom)?;
    if bytes.len() > 32 {
        return Err(E::custom(format!("U256 too large: {} bytes", bytes.len())));
    }
    Ok(U256::from_be_slice(&bytes))
}

/// Deserialize a hex string to u64.
fn deserialize_hex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_hex_u64(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional hex string to u64.
fn deserialize_hex_u64_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s {
        Some(s) => parse_hex_u64(&s).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize a hex string to U256.
fn deserialize_hex_u256<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    decode_u256(&s)
}

/// Deserialize an optional hex string to U256.
fn deserialize_hex_u256_opt<'de, D>(deserializer: D) -> Result<Option<U256>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    s.map(|s| decode_u256(&s)).transpose()
}

/// Deserialize a hex string (or null / missing) to U256, treating both as zero.
fn deserialize_hex_u256_lenient<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s {
        Some(s) => decode_u256(&s),
        None => Ok(U256::ZERO),
    }
}

/// Deserialize a hex string to B256.
fn deserialize_hex_b256<'de, D>(deserializer: D) -> Result<B256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let bytes = decode_fixed::<D::Error>(&s, 32, "hash")?;
    Ok(B256::from_slice(&bytes))
}

/// Deserialize an optional hex string to B256.
fn deserialize_hex_b256_opt<'de, D>(deserializer: D) -> Result<Option<B256>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s {
        Some(s) if !s.trim_start_matches("0x").is_empty() => {
            let bytes = decode_fixed::<D::Error>(&s, 32, "hash")?;
            Ok(Some(B256::from_slice(&bytes)))
        }
        _ => Ok(None),
    }
}

/// Deserialize a hex string to Address.
fn deserialize_hex_address<'de, D>(deserializer: D) -> Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let bytes = decode_fixed::<D::Error>(&s, 20, "address")?;
    Ok(Address::from_slice(&bytes))
}

/// Deserialize an optional hex string to Address.
fn deserialize_hex_address_opt<'de, D>(deserializer: D) -> Result<Option<Address>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s {
        Some(s) if !s.trim_start_matches("0x").is_empty() => {
            let bytes = decode_fixed::<D::Error>(&s, 20, "address")?;
            Ok(Some(Address::from_slice(&bytes)))
        }
        _ => Ok(None),
    }
}

/// Deserialize a hex string to bytes.
fn deserialize_hex_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    let s = s.strip_prefix("0x").unwrap_or(&s);
    if s.is_empty() {
        Ok(Vec::new())
    } else {
        let s = pad_hex_string(s);
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Deserialize a 256-byte logs bloom. Missing or empty means the zero bloom.
fn deserialize_hex_bloom<'de, D>(deserializer: D) -> Result<Bloom, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    if s.trim_start_matches("0x").is_empty() {
        return Ok(Bloom::ZERO);
    }
    let bytes = decode_fixed::<D::Error>(&s, 256, "logs bloom")?;
    Ok(Bloom::from_slice(&bytes))
}

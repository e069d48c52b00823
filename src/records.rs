//! Record types for cached chain data
//!
//! These structs are what the cache stores and what callers receive. They use
//! postcard for the binary cache form and serde_json for the debug form.
//! Wire-level parsing of RPC responses lives in `types`.

use alloy_primitives::{Address, Bloom, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A block with its full transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block number
    pub number: u64,
    /// Block hash
    pub hash: B256,
    /// Parent block hash
    pub parent_hash: B256,
    /// Block timestamp (Unix epoch seconds)
    pub timestamp: u64,
    /// Gas limit
    pub gas_limit: u64,
    /// Gas used by all transactions
    pub gas_used: u64,
    /// Block beneficiary
    pub miner: Address,
    /// Bloom over every log in the block
    pub logs_bloom: Bloom,
    /// Transactions in block order
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Whether the block is at or after the given fork boundary.
    pub fn is_post_fork(&self, fork_block: u64) -> bool {
        self.number >= fork_block
    }

    /// Whether the block carries no transactions.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Transaction at `index`, if present.
    pub fn transaction(&self, index: u64) -> Option<&Transaction> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.transactions.get(i))
    }
}

/// A transaction.
///
/// The owning block is referenced by `(block_number, transaction_index)` and
/// resolved through a `BlockRegistry`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction hash
    pub hash: B256,
    /// Hash of the owning block
    pub block_hash: B256,
    /// Number of the owning block
    pub block_number: u64,
    /// Position within the owning block
    pub transaction_index: u64,
    /// Sender nonce
    pub nonce: u64,
    /// Sender
    pub from: Address,
    /// Recipient (None for contract creation)
    pub to: Option<Address>,
    /// Value transferred in wei
    pub value: U256,
    /// Gas limit supplied by the sender
    pub gas: u64,
    /// Gas price in wei
    pub gas_price: U256,
    /// Call data
    pub input: Vec<u8>,
    /// Derived failure flag; see `Session::query_block`
    pub is_error: bool,
    /// Receipt, once resolved
    pub receipt: Receipt,
}

/// A transaction receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Status: 1 = success, 0 = failure. Absent before the status fork.
    pub status: Option<u64>,
    /// Gas actually used
    pub gas_used: u64,
    /// Created contract, if any
    pub contract_address: Option<Address>,
    /// Logs in emission order
    pub logs: Vec<LogEntry>,
}

impl Receipt {
    /// Whether the receipt explicitly reports failure.
    pub fn is_failure(&self) -> bool {
        self.status == Some(0)
    }
}

/// Log entry emitted during execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Emitting contract
    pub address: Address,
    /// Position within the block
    pub log_index: u64,
    /// Indexed topics
    pub topics: Vec<B256>,
    /// Non-indexed data
    pub data: Vec<u8>,
}

/// One step of a transaction's execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub block_hash: B256,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub transaction_position: u64,
    /// Position in the call tree; empty for the top-level call
    pub trace_address: Vec<u64>,
    pub subtraces: u64,
    /// call / create / suicide / reward
    pub trace_type: String,
    pub error: Option<String>,
    pub action: TraceAction,
    pub result: Option<TraceResult>,
}

impl Trace {
    /// Whether this is the top-level call of its transaction.
    pub fn is_top_level(&self) -> bool {
        self.trace_address.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceAction {
    pub call_type: Option<String>,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub gas: u64,
    pub input: Vec<u8>,
    pub value: U256,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceResult {
    pub gas_used: u64,
    pub output: Vec<u8>,
    /// Created contract for create traces
    pub address: Option<Address>,
}

/// Owns blocks for the duration of a call chain so transactions can resolve
/// their owning block by number.
#[derive(Debug, Default)]
pub struct BlockRegistry {
    blocks: HashMap<u64, Block>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a block, replacing any previous block with the same number.
    pub fn insert(&mut self, block: Block) -> &Block {
        let number = block.number;
        self.blocks.insert(number, block);
        &self.blocks[&number]
    }

    pub fn get(&self, number: u64) -> Option<&Block> {
        self.blocks.get(&number)
    }

    pub fn contains(&self, number: u64) -> bool {
        self.blocks.contains_key(&number)
    }

    /// The block owning `tx`, if registered.
    pub fn owning_block(&self, tx: &Transaction) -> Option<&Block> {
        self.blocks
            .get(&tx.block_number)
            .filter(|block| block.hash == tx.block_hash || tx.block_hash == B256::ZERO)
    }

    /// The registered copy of `tx` inside its owning block.
    pub fn resolve(&self, tx: &Transaction) -> Option<&Transaction> {
        self.owning_block(tx)
            .and_then(|block| block.transaction(tx.transaction_index))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

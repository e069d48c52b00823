//! chaincache - Ethereum block, transaction and trace cache
//!
//! This library fetches chain data from a node over JSON-RPC and keeps
//! non-empty blocks in a sharded binary cache, with a sorted index of cached
//! block numbers and per-range bloom filters. Visitor-style traversals walk
//! blocks, transactions, logs and traces from either source.

pub mod cli;
pub mod config;
pub mod node;
pub mod records;
pub mod rpc;
pub mod trace;
pub mod traversal;
pub mod txref;
pub mod types;

// Disk cache modules
pub mod bloom;
pub mod cache;
pub mod full_index;
pub mod lock;
pub mod paths;

#[cfg(test)]
mod testing;

// Re-export the main types for convenience
pub use cache::{BinaryCache, CacheError};
pub use config::NodeConfig;
pub use node::{BlockId, CacheSummary, NodeError, Provider, Session};
pub use records::{Block, LogEntry, Receipt, Trace, Transaction};
pub use rpc::{HttpTransport, RpcClient, RpcError, Transport};
pub use traversal::{ListedTransaction, BLOCK_NOT_FOUND, TRANS_NOT_FOUND};

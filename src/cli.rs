//! CLI implementation for chaincache
//!
//! Thin command surface over a `Session`. All commands output pretty JSON.

use crate::bloom::BloomIndex;
use crate::config::{NodeConfig, DEFAULT_FORK_BLOCK};
use crate::node::{BlockId, Provider, Session};
use crate::records::Block;
use crate::trace::DEFAULT_CEILING;
use crate::traversal::ListedTransaction;
use crate::types::pad_hex_string;
use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;

/// Block and transaction cache for Ethereum nodes
#[derive(Parser)]
#[command(name = "chaincache")]
#[command(about = "Cache and query blocks, transactions and traces from an Ethereum node")]
pub struct Cli {
    /// RPC endpoint of the local node
    #[arg(short, long, default_value = "http://127.0.0.1:8545")]
    rpc_url: String,

    /// RPC endpoint used when the provider is 'remote'
    #[arg(long)]
    remote_url: Option<String>,

    /// Root of the on-disk cache
    #[arg(short, long, default_value = "./cache")]
    cache_root: PathBuf,

    /// Data source: remote, local or binary
    #[arg(short, long, default_value = "binary")]
    provider: String,

    /// First block whose receipts carry a status field
    #[arg(long, default_value_t = DEFAULT_FORK_BLOCK)]
    fork_block: u64,

    /// Give up counting traces at this offset
    #[arg(long, default_value_t = DEFAULT_CEILING)]
    trace_ceiling: u64,

    /// Milliseconds a blocking lock waits before failing
    #[arg(long, default_value_t = 10_000)]
    lock_wait_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ScanMode {
    /// Every block, cache first
    All,
    /// Every block, always from the node
    Disk,
    /// Blocks listed in the full index
    NonEmpty,
    /// Blocks missing from the full index
    Empty,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Get a block by number, hash or 'latest'
    Block {
        id: BlockId,
        /// Consult traces to flag failed transactions before the fork block
        #[arg(long)]
        trace: bool,
    },
    /// Get a transaction by hash
    Tx { hash: String },
    /// Get a transaction by block number and position
    TxAt { block: u64, index: u64 },
    /// Resolve a pipe-delimited list of transaction references
    List { refs: String },
    /// Get a transaction receipt
    Receipt { hash: String },
    /// Get the traces of a transaction
    Traces { hash: String },
    /// Count the traces of a transaction by probing
    TraceCount { hash: String },
    /// Get logs emitted by an address
    Logs { address: String, from: u64, to: u64 },
    /// Latest block in the cache and on the node
    Latest,
    /// Node client version
    Version,
    /// Node sync status
    Syncing,
    /// Accounts managed by the node
    Accounts,
    /// Keccak-256 of hex data, computed by the node
    Sha3 { hex_data: String },
    /// Balance of an address at a block
    Balance { address: String, block: u64 },
    /// Code deployed at an address
    Code { address: String },
    /// Whether the node serves historical balances
    HasBalances,
    /// Fetch a block range into the cache
    Cache { start: u64, count: u64 },
    /// Summarize blocks in a range
    Scan {
        start: u64,
        count: u64,
        #[arg(long, default_value_t = 1)]
        skip: u64,
        #[arg(long, value_enum, default_value = "all")]
        mode: ScanMode,
    },
    /// List bloom files, or blocks whose bloom may hold an address
    Blooms {
        #[arg(default_value_t = 0)]
        start: u64,
        #[arg(default_value_t = u64::MAX)]
        count: u64,
        #[arg(long)]
        address: Option<String>,
    },
}

impl Cli {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            rpc_url: self.rpc_url.clone(),
            remote_url: self.remote_url.clone(),
            cache_root: self.cache_root.clone(),
            provider: Provider::from_source(&self.provider),
            fork_block: self.fork_block,
            trace_ceiling: self.trace_ceiling,
            lock_wait: Duration::from_millis(self.lock_wait_ms),
        }
    }
}

/// Parse a hex string into a 20-byte address.
fn parse_address(s: &str) -> Result<Address> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s)
        .with_context(|| format!("Invalid hex address: {}", s))?;
    if bytes.len() != 20 {
        anyhow::bail!("Address must be 20 bytes (40 hex chars), got {} bytes", bytes.len());
    }
    Ok(Address::from_slice(&bytes))
}

/// Parse a hex string into a 32-byte hash (B256).
fn parse_hash(s: &str) -> Result<B256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s)
        .with_context(|| format!("Invalid hex hash: {}", s))?;
    if bytes.len() != 32 {
        anyhow::bail!("Hash must be 32 bytes (64 hex chars), got {} bytes", bytes.len());
    }
    Ok(B256::from_slice(&bytes))
}

fn summarize(block: &Block) -> Value {
    json!({
        "number": block.number,
        "hash": format!("0x{:x}", block.hash),
        "timestamp": block.timestamp,
        "transactions": block.transactions.len(),
    })
}

/// Run a parsed command and print JSON output.
pub async fn run(cli: Cli) -> Result<()> {
    let mut session = Session::connect(cli.node_config())
        .with_context(|| format!("Failed to open cache at {:?}", cli.cache_root))?;

    let result = match cli.command {
        Commands::Block { id, trace } => {
            let block = match (id, trace) {
                (BlockId::Number(num), false) => session.get_block(num).await?,
                _ => session.query_block(id, trace).await?,
            };
            serde_json::to_value(&block)?
        }
        Commands::Tx { hash } => {
            let tx = session.get_transaction(parse_hash(&hash)?).await?;
            serde_json::to_value(&tx)?
        }
        Commands::TxAt { block, index } => {
            let tx = session
                .get_transaction_by_block_number_and_index(block, index)
                .await?;
            serde_json::to_value(&tx)?
        }
        Commands::List { refs } => {
            let mut listed: Vec<ListedTransaction> = Vec::new();
            let _flow = session
                .for_every_transaction_in_list(&refs, &mut listed, |tx, listed| {
                    listed.push(tx.clone());
                    ControlFlow::Continue(())
                })
                .await?;
            serde_json::to_value(&listed)?
        }
        Commands::Receipt { hash } => {
            let receipt = session.get_receipt(parse_hash(&hash)?).await?;
            serde_json::to_value(&receipt)?
        }
        Commands::Traces { hash } => {
            let traces = session.get_traces(parse_hash(&hash)?).await?;
            serde_json::to_value(&traces)?
        }
        Commands::TraceCount { hash } => {
            let hash = parse_hash(&hash)?;
            let count = session.trace_count(hash).await?;
            json!({ "hash": format!("0x{:x}", hash), "trace_count": count })
        }
        Commands::Logs { address, from, to } => {
            let logs = session.get_logs(parse_address(&address)?, from, to).await?;
            serde_json::to_value(&logs)?
        }
        Commands::Latest => serde_json::to_value(session.latest_blocks().await?)?,
        Commands::Version => json!({ "client_version": session.client_version().await? }),
        Commands::Syncing => match session.syncing().await? {
            Some(status) => serde_json::to_value(status)?,
            None => json!(false),
        },
        Commands::Accounts => {
            let accounts: Vec<String> = session
                .accounts()
                .await?
                .iter()
                .map(|a| format!("0x{:x}", a))
                .collect();
            json!(accounts)
        }
        Commands::Sha3 { hex_data } => {
            let hex_data = hex_data.strip_prefix("0x").unwrap_or(&hex_data);
            let data = hex::decode(pad_hex_string(hex_data)).context("Invalid hex data")?;
            json!({ "sha3": format!("0x{:x}", session.sha3(&data).await?) })
        }
        Commands::Balance { address, block } => {
            let balance = session.get_balance(parse_address(&address)?, block).await?;
            json!({ "block": block, "balance": balance.to_string() })
        }
        Commands::Code { address } => {
            let code = session.get_code(parse_address(&address)?).await?;
            json!({ "code": format!("0x{}", hex::encode(code)) })
        }
        Commands::HasBalances => json!({ "has_balances": session.node_has_balances().await? }),
        Commands::Cache { start, count } => {
            let summary = session
                .cache_range(start, count)
                .await
                .with_context(|| format!("Failed to cache blocks {}..{}", start, start.saturating_add(count)))?;
            serde_json::to_value(&summary)?
        }
        Commands::Scan {
            start,
            count,
            skip,
            mode,
        } => {
            let mut blocks: Vec<Value> = Vec::new();
            let collect = |block: &Block, blocks: &mut Vec<Value>| {
                blocks.push(summarize(block));
                ControlFlow::Continue(())
            };
            let _flow = match mode {
                ScanMode::All => session.for_every_block(start, count, skip, &mut blocks, collect).await?,
                ScanMode::Disk => {
                    session
                        .for_every_block_on_disk(start, count, skip, &mut blocks, collect)
                        .await?
                }
                ScanMode::NonEmpty => {
                    session
                        .for_every_non_empty_block(start, count, skip, &mut blocks, collect)
                        .await?
                }
                ScanMode::Empty => {
                    session
                        .for_every_empty_block(start, count, skip, &mut blocks, collect)
                        .await?
                }
            };
            json!(blocks)
        }
        Commands::Blooms {
            start,
            count,
            address,
        } => {
            let address = address.as_deref().map(parse_address).transpose()?;
            scan_blooms(session.blooms(), start, count, address)?
        }
    };

    // Pretty print JSON
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Bloom files in the range, or with an address, the blocks in the range
/// whose bloom may hold it.
fn scan_blooms(
    blooms: &BloomIndex,
    start: u64,
    count: u64,
    address: Option<Address>,
) -> Result<Value> {
    if let Some(address) = address {
        let blocks = blooms
            .blocks_matching(start, count, &address)
            .context("Failed to read bloom files")?;
        return Ok(json!(blocks));
    }

    let mut found: Vec<Value> = Vec::new();
    let _flow = blooms.for_every_bloom_file(start, count, &mut found, |path, found| {
        found.push(json!(path.display().to_string()));
        ControlFlow::Continue(())
    })?;
    Ok(json!(found))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BinaryCache;
    use crate::lock::{Access, LockMode, LockRegistry};
    use crate::testing::{address, sample_block};
    use alloy_primitives::Bloom;
    use tempfile::TempDir;

    #[test]
    fn test_parse_helpers() {
        let address = parse_address("0x00000000000000000000000000000000000000ff").unwrap();
        assert_eq!(address.0[19], 0xff);
        assert!(parse_address("0x1234").is_err());

        // Odd-length hex is padded
        let hash = parse_hash(&format!("0x{}", "a".repeat(63))).unwrap();
        assert_eq!(hash.0[0], 0x0a);
        assert!(parse_hash("0xzz").is_err());
    }

    #[test]
    fn test_global_options() {
        let cli = Cli::try_parse_from([
            "chaincache",
            "--provider",
            "local",
            "--lock-wait-ms",
            "250",
            "--cache-root",
            "/tmp/chain",
            "latest",
        ])
        .unwrap();
        let config = cli.node_config();
        assert_eq!(config.provider, Provider::Local);
        assert_eq!(config.lock_wait, Duration::from_millis(250));
        assert_eq!(config.cache_root, PathBuf::from("/tmp/chain"));
        assert_eq!(config.fork_block, DEFAULT_FORK_BLOCK);
        assert!(matches!(cli.command, Commands::Latest));
    }

    #[test]
    fn test_subcommands() {
        let cli = Cli::try_parse_from(["chaincache", "block", "46147", "--trace"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Block {
                id: BlockId::Number(46147),
                trace: true
            }
        ));

        let cli = Cli::try_parse_from(["chaincache", "scan", "0", "10", "--mode", "non-empty"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Scan {
                mode: ScanMode::NonEmpty,
                skip: 1,
                ..
            }
        ));

        let cli = Cli::try_parse_from(["chaincache", "blooms"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Blooms {
                start: 0,
                count: u64::MAX,
                address: None
            }
        ));

        let cli = Cli::try_parse_from([
            "chaincache",
            "balance",
            "0xbb9bc244d798123fde783fcc1c72d3bb8c189413",
            "1500001",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Balance { block: 1_500_001, .. }));

        assert!(Cli::try_parse_from(["chaincache", "block", "nope"]).is_err());
    }

    #[test]
    fn test_scan_blooms() {
        let temp_dir = TempDir::new().unwrap();
        let cache = BinaryCache::with_registry(temp_dir.path(), LockRegistry::new());
        let blooms = BloomIndex::new(cache.clone());
        let with_log = sample_block(2001, 1).logs_bloom;
        blooms.write(2000, &[Bloom::ZERO, with_log]).unwrap();

        let files = scan_blooms(&blooms, 0, u64::MAX, None).unwrap();
        assert_eq!(files.as_array().unwrap().len(), 1);

        let blocks = scan_blooms(&blooms, 0, u64::MAX, Some(address(0x30))).unwrap();
        assert_eq!(blocks, json!([2001]));

        // A file under a writer's lock is skipped
        let _held = cache
            .lock(&blooms.path_for(2000), Access::WriteCreate, LockMode::NoWait)
            .unwrap();
        let blocks = scan_blooms(&blooms, 0, u64::MAX, Some(address(0x30))).unwrap();
        assert_eq!(blocks, json!([]));
    }
}

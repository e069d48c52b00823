//! Provider router
//!
//! A `Session` decides per call whether an entity comes from the binary cache
//! or from a node, and runs the finishing steps that turn raw RPC entities into
//! complete records (receipts attached, error flags inferred).
//!
//! The provider mode belongs to the session. Temporary overrides go through
//! `scoped_provider`, whose guard puts the previous mode back when dropped.

use crate::bloom::{BloomIndex, BLOOM_RANGE};
use crate::cache::{BinaryCache, CacheError};
use crate::config::{establish_cache_root, ConfigError, NodeConfig};
use crate::full_index::FullIndex;
use crate::lock::{LockMode, LockRegistry};
use crate::records::{Block, LogEntry, Receipt, Trace, Transaction};
use crate::rpc::{HttpTransport, RpcClient, RpcError, SyncStatus, Transport};
use crate::trace::{TraceCountError, TraceCounter};
use alloy_primitives::{address, Address, Bloom, B256, U256};
use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Contract whose historical balance tells an archive node apart.
pub const DAO_ADDRESS: Address = address!("bb9bc244d798123fde783fcc1c72d3bb8c189413");

/// Block at which the DAO balance is checked.
pub const DAO_CHECK_BLOCK: u64 = 1_500_001;

/// DAO balance at `DAO_CHECK_BLOCK`: 4423518369662462108465682 wei.
pub const DAO_CHECK_BALANCE: U256 = U256::from_limbs([0x694c_533b_0f7d_7a12, 0x3_a8b7, 0, 0]);

/// Where entities are read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// A remote node
    Remote,
    /// The local node
    #[default]
    Local,
    /// The binary cache, falling back to the local node
    Binary,
}

impl Provider {
    /// Map a configured source name to a provider. Unknown names select the
    /// binary cache.
    pub fn from_source(source: &str) -> Self {
        match source.trim().to_ascii_lowercase().as_str() {
            "remote" => Provider::Remote,
            "local" => Provider::Local,
            _ => Provider::Binary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Remote => "remote",
            Provider::Local => "local",
            Provider::Binary => "binary",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Number(u64),
    Hash(B256),
    Latest,
}

impl FromStr for BlockId {
    type Err = anyhow::Error;

    /// `latest`, a 32-byte hex hash, a decimal number or a `0x` quantity.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") {
            return Ok(BlockId::Latest);
        }
        if let Some(hex) = s.strip_prefix("0x") {
            if hex.len() == 64 {
                return Ok(BlockId::Hash(s.parse()?));
            }
            return Ok(BlockId::Number(u64::from_str_radix(hex, 16)?));
        }
        Ok(BlockId::Number(s.parse()?))
    }
}

/// Failures surfaced by a session.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    TraceCount(#[from] TraceCountError),
}

impl NodeError {
    /// Whether the node reported the requested entity as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, NodeError::Rpc(e) if e.is_not_found())
    }
}

/// Latest block known to each source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatestBlocks {
    pub cache: Option<u64>,
    pub client: u64,
}

/// Outcome of `Session::cache_range`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheSummary {
    /// Blocks fetched
    pub fetched: u64,
    /// Non-empty blocks written to the binary cache
    pub cached: Vec<u64>,
    /// Blocks another writer was already producing
    pub skipped: Vec<u64>,
    /// New entries in the full index
    pub indexed: usize,
    /// Bloom range files written
    pub bloom_ranges: Vec<u64>,
}

/// One call chain's view of the node and the cache.
pub struct Session<T: Transport = HttpTransport> {
    config: NodeConfig,
    local: RpcClient<T>,
    remote: Option<RpcClient<T>>,
    cache: BinaryCache,
    full_index: FullIndex,
    blooms: BloomIndex,
    traces: TraceCounter,
    provider: Provider,
}

impl Session<HttpTransport> {
    /// Open a session over HTTP, preparing the cache root.
    pub fn connect(config: NodeConfig) -> Result<Self, ConfigError> {
        let local = HttpTransport::new(config.rpc_url.clone());
        let remote = config.remote_url.clone().map(HttpTransport::new);
        Self::with_transports(config, local, remote, LockRegistry::global())
    }
}

impl<T: Transport> Session<T> {
    /// Open a session over arbitrary transports.
    pub fn with_transports(
        config: NodeConfig,
        local: T,
        remote: Option<T>,
        registry: LockRegistry,
    ) -> Result<Self, ConfigError> {
        establish_cache_root(&config.cache_root)?;
        let cache = BinaryCache::with_registry(&config.cache_root, registry)
            .with_lock_wait(config.lock_wait);

        Ok(Self {
            local: RpcClient::new(local),
            remote: remote.map(RpcClient::new),
            full_index: FullIndex::new(cache.clone()),
            blooms: BloomIndex::new(cache.clone()),
            traces: TraceCounter::new(config.trace_ceiling),
            provider: config.provider,
            cache,
            config,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn cache(&self) -> &BinaryCache {
        &self.cache
    }

    pub fn full_index(&self) -> &FullIndex {
        &self.full_index
    }

    pub fn blooms(&self) -> &BloomIndex {
        &self.blooms
    }

    /// Current provider mode.
    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn set_provider(&mut self, provider: Provider) {
        self.provider = provider;
    }

    /// Switch to `provider` until the returned guard is dropped.
    pub fn scoped_provider(&mut self, provider: Provider) -> ProviderGuard<'_, T> {
        let previous = std::mem::replace(&mut self.provider, provider);
        ProviderGuard {
            session: self,
            previous,
        }
    }

    /// Node used for live queries under `provider`.
    pub fn client(&self, provider: Provider) -> &RpcClient<T> {
        match (provider, &self.remote) {
            (Provider::Remote, Some(remote)) => remote,
            _ => &self.local,
        }
    }

    /// The session's provider with the binary cache taken out of the picture.
    pub(crate) fn live_provider(&self) -> Provider {
        match self.provider {
            Provider::Binary => Provider::Local,
            other => other,
        }
    }

    /// Block `num`, from the cache when it holds the block and from the
    /// session's provider otherwise.
    ///
    /// The choice is made for this call only; the session's mode is untouched.
    /// Live blocks are allowed trace lookups for their error flags.
    pub async fn get_block(&self, num: u64) -> Result<Block, NodeError> {
        let provider = if self.cache.has_block(num) {
            Provider::Binary
        } else {
            self.provider
        };
        self.query_block_with(provider, BlockId::Number(num), true).await
    }

    /// Block by hash, always live.
    pub async fn get_block_by_hash(&self, hash: B256) -> Result<Block, NodeError> {
        self.query_block(BlockId::Hash(hash), false).await
    }

    /// Block under the session's provider.
    ///
    /// `need_trace` allows trace lookups to infer error flags on blocks before
    /// the fork boundary.
    pub async fn query_block(&self, id: BlockId, need_trace: bool) -> Result<Block, NodeError> {
        self.query_block_with(self.provider, id, need_trace).await
    }

    pub(crate) async fn query_block_with(
        &self,
        provider: Provider,
        id: BlockId,
        need_trace: bool,
    ) -> Result<Block, NodeError> {
        let client = self.client(provider);
        let num = match id {
            BlockId::Hash(hash) => {
                let mut block = client.get_block_by_hash(hash).await?;
                self.attach_receipts(client, &mut block, need_trace).await?;
                return Ok(block);
            }
            BlockId::Number(num) => num,
            BlockId::Latest => self.latest_block_from_client().await?,
        };

        if provider == Provider::Binary {
            if self.cache.has_block(num) {
                match self.cache.read_block(num, LockMode::NoWait) {
                    Ok(block) => return Ok(block),
                    Err(e) if e.is_recoverable() => {
                        warn!(block = num, error = %e, "cache unavailable, querying node");
                    }
                    Err(e) => return Err(e.into()),
                }
            } else {
                debug!(block = num, "not in cache, querying node");
            }
        }

        let mut block = client.get_block_by_number(num).await?;
        self.attach_receipts(client, &mut block, need_trace).await?;
        Ok(block)
    }

    /// Attach receipts and infer each transaction's error flag.
    ///
    /// At and after the fork boundary the receipt status decides. Before it,
    /// a transaction that used all its gas is checked against its top-level
    /// trace, and only when the caller asked for traces.
    async fn attach_receipts(
        &self,
        client: &RpcClient<T>,
        block: &mut Block,
        need_trace: bool,
    ) -> Result<(), NodeError> {
        let post_fork = block.is_post_fork(self.config.fork_block);
        for tx in block.transactions.iter_mut() {
            let receipt = client.get_transaction_receipt(tx.hash).await?;
            tx.is_error = if post_fork {
                receipt.is_failure()
            } else if need_trace && tx.gas == receipt.gas_used {
                let traces = client.get_traces(tx.hash).await?;
                traces
                    .iter()
                    .find(|t| t.is_top_level())
                    .map_or(false, |t| t.error.is_some())
            } else {
                false
            };
            tx.receipt = receipt;
        }
        Ok(())
    }

    /// Transaction by hash.
    pub async fn get_transaction(&self, hash: B256) -> Result<Transaction, NodeError> {
        Ok(self
            .client(self.live_provider())
            .get_transaction_by_hash(hash)
            .await?)
    }

    /// Transaction by block hash and position.
    pub async fn get_transaction_by_block_hash_and_index(
        &self,
        block_hash: B256,
        index: u64,
    ) -> Result<Transaction, NodeError> {
        Ok(self
            .client(self.live_provider())
            .get_transaction_by_block_hash_and_index(block_hash, index)
            .await?)
    }

    /// Transaction by block number and position, served from the cache when
    /// the block is there.
    pub async fn get_transaction_by_block_number_and_index(
        &self,
        block: u64,
        index: u64,
    ) -> Result<Transaction, NodeError> {
        if self.cache.has_block(block) {
            match self.cache.read_block(block, LockMode::NoWait) {
                Ok(cached) => {
                    if let Some(tx) = cached.transaction(index) {
                        return Ok(tx.clone());
                    }
                }
                Err(e) if e.is_recoverable() => {
                    warn!(block, error = %e, "cache unavailable, querying node");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self
            .client(self.live_provider())
            .get_transaction_by_block_number_and_index(block, index)
            .await?)
    }

    pub async fn get_receipt(&self, tx: B256) -> Result<Receipt, NodeError> {
        Ok(self
            .client(self.live_provider())
            .get_transaction_receipt(tx)
            .await?)
    }

    pub async fn get_traces(&self, tx: B256) -> Result<Vec<Trace>, NodeError> {
        Ok(self.client(self.live_provider()).get_traces(tx).await?)
    }

    /// Number of traces of `tx`, discovered by probing.
    pub async fn trace_count(&self, tx: B256) -> Result<u64, NodeError> {
        Ok(self
            .traces
            .count(self.client(self.live_provider()), tx)
            .await?)
    }

    pub async fn get_logs(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>, NodeError> {
        Ok(self
            .client(self.live_provider())
            .get_logs(address, from_block, to_block)
            .await?)
    }

    pub async fn latest_block_from_client(&self) -> Result<u64, NodeError> {
        Ok(self.client(self.live_provider()).latest_block().await?)
    }

    /// Latest block in the full index, if it can be read without waiting.
    pub fn latest_block_from_cache(&self) -> Option<u64> {
        self.full_index.latest()
    }

    pub async fn latest_blocks(&self) -> Result<LatestBlocks, NodeError> {
        Ok(LatestBlocks {
            cache: self.latest_block_from_cache(),
            client: self.latest_block_from_client().await?,
        })
    }

    pub async fn client_version(&self) -> Result<String, NodeError> {
        Ok(self.client(self.live_provider()).client_version().await?)
    }

    pub async fn syncing(&self) -> Result<Option<SyncStatus>, NodeError> {
        Ok(self.client(self.live_provider()).syncing().await?)
    }

    pub async fn accounts(&self) -> Result<Vec<Address>, NodeError> {
        Ok(self.client(self.live_provider()).accounts().await?)
    }

    pub async fn sha3(&self, data: &[u8]) -> Result<B256, NodeError> {
        Ok(self.client(self.live_provider()).sha3(data).await?)
    }

    pub async fn get_balance(&self, address: Address, block: u64) -> Result<U256, NodeError> {
        Ok(self
            .client(self.live_provider())
            .get_balance(address, block)
            .await?)
    }

    pub async fn get_code(&self, address: Address) -> Result<Vec<u8>, NodeError> {
        Ok(self.client(self.live_provider()).get_code(address).await?)
    }

    /// Whether the node serves historical balances.
    ///
    /// Checks the DAO contract against its known balance at block 1,500,001.
    /// A node that answers with an error for that block has no history.
    pub async fn node_has_balances(&self) -> Result<bool, NodeError> {
        match self.get_balance(DAO_ADDRESS, DAO_CHECK_BLOCK).await {
            Ok(balance) => Ok(balance == DAO_CHECK_BALANCE),
            Err(NodeError::Rpc(e)) if !e.is_transport() => {
                debug!(error = %e, "node has no historical balances");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch `[start, start + count)` from the node and fill the cache.
    ///
    /// Non-empty blocks go to the binary cache and the full index. Bloom files
    /// are written for every complete range the walk covers.
    pub async fn cache_range(&self, start: u64, count: u64) -> Result<CacheSummary, NodeError> {
        let provider = self.live_provider();
        let end = start.saturating_add(count);
        let mut summary = CacheSummary::default();
        let mut pending: Option<(u64, Vec<Bloom>)> = None;

        for num in start..end {
            let block = self
                .query_block_with(provider, BlockId::Number(num), true)
                .await?;
            summary.fetched += 1;

            if !block.is_empty() {
                match self.cache.write_block(&block) {
                    Ok(_) => summary.cached.push(num),
                    Err(e @ CacheError::LockUnavailable { .. }) => {
                        warn!(block = num, error = %e, "block is cached or being written elsewhere");
                        summary.skipped.push(num);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if num % BLOOM_RANGE == 0 {
                pending = Some((num, Vec::with_capacity(BLOOM_RANGE as usize)));
            }
            if let Some((range, blooms)) = pending.as_mut() {
                blooms.push(block.logs_bloom);
                if num - *range == BLOOM_RANGE - 1 {
                    match self.blooms.write(*range, blooms) {
                        Ok(true) => summary.bloom_ranges.push(*range),
                        Ok(false) => {}
                        Err(e @ CacheError::LockUnavailable { .. }) => {
                            warn!(range = *range, error = %e, "bloom range is already stored");
                        }
                        Err(e) => return Err(e.into()),
                    }
                    pending = None;
                }
            }
        }

        // Skipped blocks were non-empty too
        let mut indexed: Vec<u64> = summary.cached.iter().chain(&summary.skipped).copied().collect();
        indexed.sort_unstable();
        summary.indexed = self.full_index.append(&indexed).await?;

        info!(
            start,
            count,
            cached = summary.cached.len(),
            bloom_ranges = summary.bloom_ranges.len(),
            "cached block range"
        );
        Ok(summary)
    }
}

/// Restores the session's previous provider when dropped.
pub struct ProviderGuard<'a, T: Transport> {
    session: &'a mut Session<T>,
    previous: Provider,
}

impl<T: Transport> Deref for ProviderGuard<'_, T> {
    type Target = Session<T>;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<T: Transport> DerefMut for ProviderGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl<T: Transport> Drop for ProviderGuard<'_, T> {
    fn drop(&mut self) {
        self.session.provider = self.previous;
    }
}

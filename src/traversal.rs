//! Traversals over blocks, transactions, logs and traces
//!
//! Every traversal takes a context value and a visitor. The visitor sees one
//! item and the context, and returns `ControlFlow::Break(())` to stop. A
//! traversal returns `Ok(ControlFlow::Break(()))` when a visitor stopped it,
//! `Ok(ControlFlow::Continue(()))` when it ran to the end, and `Err` only on
//! failure.
//!
//! Block ranges are `[start, start + count)`; `skip` is a stride (0 and 1 both
//! visit every candidate).

use crate::full_index::position;
use crate::node::{BlockId, NodeError, Session};
use crate::records::{Block, BlockRegistry, LogEntry, Trace, Transaction};
use crate::rpc::Transport;
use crate::txref::{parse_list, TxRef, TxRefError, TxTarget};
use alloy_primitives::B256;
use serde::Serialize;
use std::ops::ControlFlow;
use tracing::debug;

/// Tag for list entries whose block could not be found.
pub const BLOCK_NOT_FOUND: &str = "block_not_found";

/// Tag for list entries whose transaction could not be found.
pub const TRANS_NOT_FOUND: &str = "trans_not_found";

/// Traversal outcome.
pub type Flow = Result<ControlFlow<()>, NodeError>;

/// An entry of a transaction list as delivered to the visitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedTransaction {
    /// Transaction hash, or `<reference>-<tag>` when resolution failed
    pub id: String,
    pub transaction: Option<Transaction>,
}

impl ListedTransaction {
    fn found(tx: Transaction) -> Self {
        Self {
            id: format!("0x{:x}", tx.hash),
            transaction: Some(tx),
        }
    }

    fn missing(reference: &TxRef, tag: &str) -> Self {
        Self {
            id: format!("{}-{}", reference, tag),
            transaction: None,
        }
    }

    /// An entry that did not parse, tagged by the shape it resembles.
    fn malformed(error: &TxRefError) -> Self {
        let tag = if error.names_transaction() {
            TRANS_NOT_FOUND
        } else {
            BLOCK_NOT_FOUND
        };
        Self {
            id: format!("{}-{}", error.reference(), tag),
            transaction: None,
        }
    }

    pub fn is_found(&self) -> bool {
        self.transaction.is_some()
    }
}

fn stride(skip: u64) -> usize {
    usize::try_from(skip.max(1)).unwrap_or(usize::MAX)
}

/// Visit each transaction of `block` in order.
pub fn for_every_transaction_in_block<C, F>(block: &Block, ctx: &mut C, mut visitor: F) -> ControlFlow<()>
where
    F: FnMut(&Transaction, &mut C) -> ControlFlow<()>,
{
    for tx in &block.transactions {
        visitor(tx, ctx)?;
    }
    ControlFlow::Continue(())
}

/// Visit each log of a transaction's receipt in order.
pub fn for_every_log_in_transaction<C, F>(tx: &Transaction, ctx: &mut C, mut visitor: F) -> ControlFlow<()>
where
    F: FnMut(&LogEntry, &mut C) -> ControlFlow<()>,
{
    for log in &tx.receipt.logs {
        visitor(log, ctx)?;
    }
    ControlFlow::Continue(())
}

/// Visit every log of every transaction of `block`.
pub fn for_every_log_in_block<C, F>(block: &Block, ctx: &mut C, mut visitor: F) -> ControlFlow<()>
where
    F: FnMut(&LogEntry, &mut C) -> ControlFlow<()>,
{
    for tx in &block.transactions {
        for_every_log_in_transaction(tx, ctx, &mut visitor)?;
    }
    ControlFlow::Continue(())
}

impl<T: Transport> Session<T> {
    /// Every block in the range, cache first and node otherwise.
    pub async fn for_every_block<C, F>(
        &self,
        start: u64,
        count: u64,
        skip: u64,
        ctx: &mut C,
        mut visitor: F,
    ) -> Flow
    where
        F: FnMut(&Block, &mut C) -> ControlFlow<()>,
    {
        let end = start.saturating_add(count);
        for num in (start..end).step_by(stride(skip)) {
            let block = self.get_block(num).await?;
            if visitor(&block, ctx).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Every block in the range, always from the node.
    pub async fn for_every_block_on_disk<C, F>(
        &self,
        start: u64,
        count: u64,
        skip: u64,
        ctx: &mut C,
        mut visitor: F,
    ) -> Flow
    where
        F: FnMut(&Block, &mut C) -> ControlFlow<()>,
    {
        let provider = self.live_provider();
        let end = start.saturating_add(count);
        for num in (start..end).step_by(stride(skip)) {
            let block = self
                .query_block_with(provider, BlockId::Number(num), false)
                .await?;
            if visitor(&block, ctx).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Blocks in the range listed in the full index, ascending.
    ///
    /// `skip` strides over index entries, not block numbers.
    pub async fn for_every_non_empty_block<C, F>(
        &self,
        start: u64,
        count: u64,
        skip: u64,
        ctx: &mut C,
        mut visitor: F,
    ) -> Flow
    where
        F: FnMut(&Block, &mut C) -> ControlFlow<()>,
    {
        let index = self.full_index().load().await?;
        let end = start.saturating_add(count);
        let first = position(&index, start);
        debug!(start, end, indexed = index.len(), first, "scanning non-empty blocks");

        let in_range = index[first..].iter().take_while(|&&n| n < end);
        for &num in in_range.step_by(stride(skip)) {
            let block = self.get_block(num).await?;
            if visitor(&block, ctx).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Blocks in the range missing from the full index, up to the last
    /// indexed block.
    ///
    /// Empty blocks are never cached, so these are fetched with the binary
    /// cache switched off for the duration of the scan.
    pub async fn for_every_empty_block<C, F>(
        &mut self,
        start: u64,
        count: u64,
        skip: u64,
        ctx: &mut C,
        mut visitor: F,
    ) -> Flow
    where
        F: FnMut(&Block, &mut C) -> ControlFlow<()>,
    {
        let index = self.full_index().load().await?;
        let Some(&last) = index.last() else {
            return Ok(ControlFlow::Continue(()));
        };
        let end = start.saturating_add(count).min(last.saturating_add(1));

        let live = self.live_provider();
        let session = self.scoped_provider(live);
        let mut next_indexed = position(&index, start);
        for num in (start..end).step_by(stride(skip)) {
            while next_indexed < index.len() && index[next_indexed] < num {
                next_indexed += 1;
            }
            if index.get(next_indexed) == Some(&num) {
                continue;
            }
            let block = session.query_block(BlockId::Number(num), false).await?;
            if visitor(&block, ctx).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Visit each trace of a transaction in order.
    pub async fn for_every_trace_in_transaction<C, F>(
        &self,
        tx: &Transaction,
        ctx: &mut C,
        mut visitor: F,
    ) -> Flow
    where
        F: FnMut(&Trace, &mut C) -> ControlFlow<()>,
    {
        let traces = self.get_traces(tx.hash).await?;
        for trace in &traces {
            if visitor(trace, ctx).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Visit every trace of every transaction of `block`.
    pub async fn for_every_trace_in_block<C, F>(&self, block: &Block, ctx: &mut C, mut visitor: F) -> Flow
    where
        F: FnMut(&Trace, &mut C) -> ControlFlow<()>,
    {
        for tx in &block.transactions {
            if self
                .for_every_trace_in_transaction(tx, ctx, &mut visitor)
                .await?
                .is_break()
            {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Resolve a pipe-delimited transaction list and visit every entry once,
    /// in input order.
    ///
    /// Entries that cannot be resolved are still visited, with no transaction
    /// and an id naming the lookup that failed.
    pub async fn for_every_transaction_in_list<C, F>(&self, list: &str, ctx: &mut C, mut visitor: F) -> Flow
    where
        F: FnMut(&ListedTransaction, &mut C) -> ControlFlow<()>,
    {
        let mut registry = BlockRegistry::new();
        for entry in parse_list(list) {
            let listed = match entry {
                Ok(reference) => self.resolve(&reference, &mut registry).await?,
                Err(e) => {
                    debug!(error = %e, "malformed transaction reference");
                    ListedTransaction::malformed(&e)
                }
            };
            if !listed.is_found() {
                debug!(id = %listed.id, "unresolved transaction reference");
            }
            if visitor(&listed, ctx).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn resolve(
        &self,
        reference: &TxRef,
        registry: &mut BlockRegistry,
    ) -> Result<ListedTransaction, NodeError> {
        match &reference.target {
            TxTarget::BlockHashIndex { block, index } => {
                let Ok(hash) = block.parse::<B256>() else {
                    return Ok(ListedTransaction::missing(reference, BLOCK_NOT_FOUND));
                };
                let block = match self.get_block_by_hash(hash).await {
                    Ok(block) => registry.insert(block),
                    Err(e) if e.is_not_found() => {
                        return Ok(ListedTransaction::missing(reference, BLOCK_NOT_FOUND))
                    }
                    Err(e) => return Err(e),
                };
                Ok(match block.transaction(*index) {
                    Some(tx) => ListedTransaction::found(tx.clone()),
                    None => ListedTransaction::missing(reference, TRANS_NOT_FOUND),
                })
            }
            TxTarget::BlockNumberIndex { block, index } => {
                if !self.register_block(*block, registry).await? {
                    return Ok(ListedTransaction::missing(reference, BLOCK_NOT_FOUND));
                }
                Ok(match registry.get(*block).and_then(|b| b.transaction(*index)) {
                    Some(tx) => ListedTransaction::found(tx.clone()),
                    None => ListedTransaction::missing(reference, TRANS_NOT_FOUND),
                })
            }
            TxTarget::Hash(text) => {
                let Ok(hash) = text.parse::<B256>() else {
                    return Ok(ListedTransaction::missing(reference, TRANS_NOT_FOUND));
                };
                let tx = match self.get_transaction(hash).await {
                    Ok(tx) => tx,
                    Err(e) if e.is_not_found() => {
                        return Ok(ListedTransaction::missing(reference, TRANS_NOT_FOUND))
                    }
                    Err(e) => return Err(e),
                };
                // The owning block carries the receipt and error flag
                self.register_block(tx.block_number, registry).await?;
                let tx = registry.resolve(&tx).cloned().unwrap_or(tx);
                Ok(ListedTransaction::found(tx))
            }
        }
    }

    /// Make sure block `num` is in `registry`. Returns false when the node
    /// does not know it.
    async fn register_block(&self, num: u64, registry: &mut BlockRegistry) -> Result<bool, NodeError> {
        if registry.contains(num) {
            return Ok(true);
        }
        match self.get_block(num).await {
            Ok(block) => {
                registry.insert(block);
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

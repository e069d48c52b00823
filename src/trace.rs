//! Trace count discovery
//!
//! Nodes answer "is there a trace at offset k of this transaction" but not
//! "how many traces does it have". The count is found with as few round trips
//! as practical:
//!
//! - offsets 2..=7 are probed linearly, since most transactions are tiny;
//! - otherwise 2^8 and 2^16 are probed, and the first absent one bounds a
//!   bisection over `[0, bound - 1]`;
//! - past 2^16 the configured ceiling is the last bound. A transaction with a
//!   trace at the ceiling itself is reported as an error rather than searched.
//!
//! Bisection looks for the last present offset `m`, i.e. `present(m)` and
//! `!present(m + 1)`; the count is `m + 1`.

use crate::rpc::{RpcClient, RpcError, Transport};
use alloy_primitives::B256;
use thiserror::Error;
use tracing::debug;

/// Default upper bound for discovery.
pub const DEFAULT_CEILING: u64 = 1 << 30;

/// Offsets probed one by one before switching to bisection.
const LINEAR_OFFSETS: std::ops::RangeInclusive<u64> = 2..=7;

/// Intermediate bounds tried before the ceiling.
const BOUNDS: [u64; 2] = [1 << 8, 1 << 16];

/// Yes/no question: does `tx` have a trace at `offset`?
#[allow(async_fn_in_trait)]
pub trait TraceProbe {
    async fn has_trace_at(&self, tx: B256, offset: u64) -> Result<bool, RpcError>;
}

impl<T: Transport> TraceProbe for RpcClient<T> {
    async fn has_trace_at(&self, tx: B256, offset: u64) -> Result<bool, RpcError> {
        RpcClient::has_trace_at(self, tx, offset).await
    }
}

#[derive(Debug, Error)]
pub enum TraceCountError {
    #[error("trace probe failed: {0}")]
    Probe(#[from] RpcError),

    #[error("transaction {tx} has a trace at the discovery ceiling {ceiling}")]
    CeilingExceeded { tx: B256, ceiling: u64 },
}

/// Counts the traces of a transaction through a `TraceProbe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceCounter {
    ceiling: u64,
}

impl Default for TraceCounter {
    fn default() -> Self {
        Self::new(DEFAULT_CEILING)
    }
}

impl TraceCounter {
    /// Counter giving up at `ceiling`. Values below the linear range are
    /// raised to just past it.
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling: ceiling.max(LINEAR_OFFSETS.end() + 1),
        }
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Number of traces of `tx`.
    pub async fn count<P: TraceProbe>(&self, probe: &P, tx: B256) -> Result<u64, TraceCountError> {
        for offset in LINEAR_OFFSETS {
            if !probe.has_trace_at(tx, offset).await? {
                let count = if offset > *LINEAR_OFFSETS.start() {
                    offset
                } else {
                    tiny_count(probe, tx).await?
                };
                debug!(tx = %tx, count, "tiny trace");
                return Ok(count);
            }
        }

        let bounds = BOUNDS.iter().copied().filter(|&b| b < self.ceiling);
        for bound in bounds {
            if !probe.has_trace_at(tx, bound).await? {
                let count = bisect(probe, tx, bound).await?;
                debug!(tx = %tx, count, bound, "bounded trace");
                return Ok(count);
            }
        }

        if probe.has_trace_at(tx, self.ceiling).await? {
            return Err(TraceCountError::CeilingExceeded {
                tx,
                ceiling: self.ceiling,
            });
        }
        let count = bisect(probe, tx, self.ceiling).await?;
        debug!(tx = %tx, count, "large trace");
        Ok(count)
    }
}

/// Count when offset 2 is absent: 0, 1 or 2.
async fn tiny_count<P: TraceProbe>(probe: &P, tx: B256) -> Result<u64, RpcError> {
    if probe.has_trace_at(tx, 1).await? {
        Ok(2)
    } else if probe.has_trace_at(tx, 0).await? {
        Ok(1)
    } else {
        Ok(0)
    }
}

/// Find the last present offset in `[0, bound - 1]`, given that `bound` itself
/// is absent, and return the count.
async fn bisect<P: TraceProbe>(probe: &P, tx: B256, bound: u64) -> Result<u64, RpcError> {
    let mut first = 0u64;
    let mut last = bound - 1;

    while first < last {
        let mid = first + (last - first) / 2;
        let at_mid = probe.has_trace_at(tx, mid).await?;
        let at_next = probe.has_trace_at(tx, mid + 1).await?;

        if at_mid && !at_next {
            return Ok(mid + 1);
        }
        if !at_mid {
            if mid == 0 {
                return Ok(0);
            }
            last = mid - 1;
        } else {
            first = mid + 1;
        }
    }

    // Collapsed onto a single candidate
    if probe.has_trace_at(tx, first).await? {
        Ok(first + 1)
    } else {
        Ok(first)
    }
}

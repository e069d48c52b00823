//! Transaction reference lists
//!
//! A list is pipe-delimited; every entry names one transaction in one of
//! three shapes:
//!
//! - `0x<block hash>.<index>`: position within a block given by hash
//! - `0x<tx hash>`: transaction hash
//! - `<block number>.<index>`: position within a block given by number
//!
//! A bare decimal is a block number and means its first transaction.

use std::fmt;
use thiserror::Error;

/// What a single entry points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxTarget {
    /// Block hash (still hex text) and position
    BlockHashIndex { block: String, index: u64 },
    /// Transaction hash (still hex text)
    Hash(String),
    /// Block number and position
    BlockNumberIndex { block: u64, index: u64 },
}

/// One parsed entry with the text it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRef {
    pub reference: String,
    pub target: TxTarget,
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reference)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxRefError {
    #[error("invalid transaction reference '{reference}': {reason}")]
    Malformed { reference: String, reason: String },
}

impl TxRefError {
    /// The entry text that failed to parse.
    pub fn reference(&self) -> &str {
        match self {
            TxRefError::Malformed { reference, .. } => reference,
        }
    }

    /// Whether the entry has the shape of a transaction hash (hex, no index).
    pub fn names_transaction(&self) -> bool {
        let reference = self.reference();
        (reference.starts_with("0x") || reference.starts_with("0X")) && !reference.contains('.')
    }
}

fn malformed(reference: &str, reason: impl Into<String>) -> TxRefError {
    TxRefError::Malformed {
        reference: reference.to_string(),
        reason: reason.into(),
    }
}

/// Classify one entry by its shape.
pub fn parse_ref(entry: &str) -> Result<TxRef, TxRefError> {
    let reference = entry.trim();
    let (head, tail) = match reference.split_once('.') {
        Some((head, tail)) => (head, Some(tail)),
        None => (reference, None),
    };

    let index = tail
        .map(|t| {
            t.parse::<u64>()
                .map_err(|e| malformed(reference, format!("bad index '{}': {}", t, e)))
        })
        .transpose()?;

    let target = if let Some(hex) = head.strip_prefix("0x").or_else(|| head.strip_prefix("0X")) {
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(malformed(reference, "not a hex value"));
        }
        match index {
            Some(index) => TxTarget::BlockHashIndex {
                block: head.to_string(),
                index,
            },
            None => TxTarget::Hash(head.to_string()),
        }
    } else {
        let block = head
            .parse::<u64>()
            .map_err(|e| malformed(reference, format!("bad block number '{}': {}", head, e)))?;
        TxTarget::BlockNumberIndex {
            block,
            index: index.unwrap_or(0),
        }
    };

    Ok(TxRef {
        reference: reference.to_string(),
        target,
    })
}

/// Parse a pipe-delimited list, keeping input order. Blank entries are
/// skipped; a malformed entry does not affect its neighbours.
pub fn parse_list(list: &str) -> Vec<Result<TxRef, TxRefError>> {
    list.split('|')
        .filter(|entry| !entry.trim().is_empty())
        .map(parse_ref)
        .collect()
}

//! Bloom side-index
//!
//! Blocks are grouped into ranges of `BLOOM_RANGE` starting on multiples of
//! `BLOOM_RANGE`. Each range has one file holding the 256-byte logs bloom of
//! every block in the range, concatenated in block order. Scanning these files
//! lets log searches skip ranges without touching block files.

use crate::cache::{BinaryCache, CacheError};
use crate::lock::LockMode;
use alloy_primitives::{Address, Bloom, BloomInput, B256};
use std::fs;
use std::io::ErrorKind;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Blocks per bloom file.
pub const BLOOM_RANGE: u64 = 1000;

/// Bytes per bloom.
pub const BLOOM_SIZE: usize = 256;

/// First block of the range containing `num`.
pub fn range_start(num: u64) -> u64 {
    num / BLOOM_RANGE * BLOOM_RANGE
}

/// Whether `bloom` may contain logs emitted by `address`.
pub fn may_contain(bloom: &Bloom, address: &Address) -> bool {
    bloom.contains_input(BloomInput::Raw(address.as_slice()))
}

/// Whether `bloom` may contain logs carrying `topic`.
pub fn may_contain_topic(bloom: &Bloom, topic: &B256) -> bool {
    bloom.contains_input(BloomInput::Raw(topic.as_slice()))
}

/// Reader and writer of bloom range files.
#[derive(Debug, Clone)]
pub struct BloomIndex {
    cache: BinaryCache,
}

impl BloomIndex {
    pub fn new(cache: BinaryCache) -> Self {
        Self { cache }
    }

    /// Bloom file for the range containing `num`.
    pub fn path_for(&self, num: u64) -> PathBuf {
        self.cache.paths().bloom_bin(range_start(num))
    }

    /// Write the blooms of the range starting at `start`.
    ///
    /// Returns `Ok(false)` without touching disk when there is nothing worth
    /// storing: no blooms at all, or a single zero bloom.
    pub fn write(&self, start: u64, blooms: &[Bloom]) -> Result<bool, CacheError> {
        check_aligned(start)?;
        if blooms.is_empty() || (blooms.len() == 1 && blooms[0] == Bloom::ZERO) {
            return Ok(false);
        }

        let bytes: Vec<u8> = blooms.iter().flat_map(|b| b.as_slice().iter().copied()).collect();
        self.cache.write_bytes(&bytes, &self.path_for(start))?;
        debug!(start, count = blooms.len(), "wrote bloom range");
        Ok(true)
    }

    /// Read the blooms of the range starting at `start`. Never blocks.
    pub fn read(&self, start: u64) -> Result<Vec<Bloom>, CacheError> {
        check_aligned(start)?;
        let path = self.path_for(start);
        let bytes = self.cache.read_bytes(&path, LockMode::NoWait)?;
        decode(&path, &bytes)
    }

    /// Bloom of block `num`, or None when its range file does not cover it.
    pub fn bloom_of(&self, num: u64) -> Result<Option<Bloom>, CacheError> {
        let blooms = match self.read(range_start(num)) {
            Ok(blooms) => blooms,
            Err(CacheError::Missing(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(blooms.get((num - range_start(num)) as usize).copied())
    }

    /// Visit bloom files in ascending order.
    ///
    /// `start == 0` with `count == u64::MAX` visits every bloom file.
    /// Otherwise only the shard folders covering `[start, start + count)` are
    /// visited; callers still filter by block number.
    pub fn for_every_bloom_file<C, F>(
        &self,
        start: u64,
        count: u64,
        ctx: &mut C,
        mut visitor: F,
    ) -> Result<ControlFlow<()>, CacheError>
    where
        F: FnMut(&Path, &mut C) -> ControlFlow<()>,
    {
        if start == 0 && count == u64::MAX {
            let mut files = Vec::new();
            collect_files(&self.cache.paths().blooms_root(), true, &mut files)?;
            files.sort();
            for file in &files {
                if visitor(file, ctx).is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }
            return Ok(ControlFlow::Continue(()));
        }

        let first = range_start(start);
        let end = start.saturating_add(count);
        let mut range = first;
        while range < end {
            let mut files = Vec::new();
            collect_files(&self.cache.paths().bloom_dir(range), false, &mut files)?;
            files.sort();
            for file in &files {
                if visitor(file, ctx).is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }
            range = match range.checked_add(BLOOM_RANGE) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Blocks in `[start, start + count)` whose stored bloom may hold logs of
    /// `address`, ascending.
    ///
    /// Range files are read under the cache lock. A range that is missing or
    /// being written is skipped with a warning.
    pub fn blocks_matching(
        &self,
        start: u64,
        count: u64,
        address: &Address,
    ) -> Result<Vec<u64>, CacheError> {
        let mut ranges = Vec::new();
        let _flow = self.for_every_bloom_file(start, count, &mut ranges, |path, ranges| {
            if let Some(range) = range_of(path) {
                ranges.push(range);
            }
            ControlFlow::Continue(())
        })?;

        let end = start.saturating_add(count);
        let mut found = Vec::new();
        for range in ranges {
            let blooms = match self.read(range) {
                Ok(blooms) => blooms,
                Err(e) if e.is_recoverable() => {
                    warn!(range, error = %e, "skipping bloom range");
                    continue;
                }
                Err(e) => return Err(e),
            };
            for (offset, bloom) in blooms.iter().enumerate() {
                let block = range + offset as u64;
                if block >= start && block < end && may_contain(bloom, address) {
                    found.push(block);
                }
            }
        }
        Ok(found)
    }
}

/// Range start encoded in a bloom file name.
fn range_of(path: &Path) -> Option<u64> {
    let range: u64 = path.file_stem()?.to_str()?.parse().ok()?;
    (range % BLOOM_RANGE == 0).then_some(range)
}

fn check_aligned(start: u64) -> Result<(), CacheError> {
    if start % BLOOM_RANGE != 0 {
        return Err(CacheError::UnalignedRange {
            start,
            width: BLOOM_RANGE,
        });
    }
    Ok(())
}

fn decode(path: &Path, bytes: &[u8]) -> Result<Vec<Bloom>, CacheError> {
    if bytes.len() % BLOOM_SIZE != 0 {
        return Err(CacheError::Corrupt {
            path: path.to_path_buf(),
            detail: format!("length {} is not a multiple of {}", bytes.len(), BLOOM_SIZE),
        });
    }
    Ok(bytes.chunks_exact(BLOOM_SIZE).map(Bloom::from_slice).collect())
}

fn is_bloom_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("bin")
}

/// Bloom files under `dir`, descending into subfolders when `recursive`. A
/// missing folder holds nothing.
fn collect_files(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> Result<(), CacheError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(CacheError::Io {
                path: dir.to_path_buf(),
                source: e,
            })
        }
    };
    for entry in entries {
        let path = entry
            .map_err(|e| CacheError::Io {
                path: dir.to_path_buf(),
                source: e,
            })?
            .path();
        if path.is_dir() {
            if recursive {
                collect_files(&path, true, out)?;
            }
        } else if is_bloom_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

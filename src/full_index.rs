//! Full block index
//!
//! `root/fullBlocks.bin` is an append-only array of little-endian u64 block
//! numbers, strictly increasing, listing every block that has at least one
//! transaction. The last 8 bytes are therefore the latest indexed block.

use crate::cache::{BinaryCache, CacheError};
use crate::lock::{Access, LockMode};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const ENTRY_SIZE: usize = std::mem::size_of::<u64>();

/// Reader and appender for the full block index.
#[derive(Debug, Clone)]
pub struct FullIndex {
    cache: BinaryCache,
}

impl FullIndex {
    pub fn new(cache: BinaryCache) -> Self {
        Self { cache }
    }

    pub fn path(&self) -> PathBuf {
        self.cache.paths().full_index()
    }

    /// Latest indexed block.
    ///
    /// Never blocks: a held writer lock, a missing file or an empty file all
    /// yield `None`.
    pub fn latest(&self) -> Option<u64> {
        let path = self.path();
        let _lock = match self.cache.lock(&path, Access::ReadOnly, LockMode::NoWait) {
            Ok(lock) => lock,
            Err(e) => {
                warn!(error = %e, "full index busy, latest block unknown");
                return None;
            }
        };

        match read_tail(&path) {
            Ok(latest) => latest,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read full index tail");
                None
            }
        }
    }

    /// Every indexed block, waiting for a writer if one holds the lock.
    ///
    /// A missing index reads as empty. A trailing partial entry is ignored.
    pub async fn load(&self) -> Result<Vec<u64>, CacheError> {
        let path = self.path();
        let bytes = match self.cache.read_bytes_waiting(&path).await {
            Ok(bytes) => bytes,
            Err(CacheError::Missing(_)) => {
                debug!(path = %path.display(), "no full index yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let remainder = bytes.len() % ENTRY_SIZE;
        if remainder != 0 {
            warn!(
                path = %path.display(),
                trailing = remainder,
                "ignoring partial entry at end of full index"
            );
        }

        Ok(bytes
            .chunks_exact(ENTRY_SIZE)
            .map(|chunk| {
                let mut buf = [0u8; ENTRY_SIZE];
                buf.copy_from_slice(chunk);
                u64::from_le_bytes(buf)
            })
            .collect())
    }

    /// Append block numbers past the current tail.
    ///
    /// Input is sorted and deduplicated first; numbers at or below the tail
    /// are already indexed and skipped. A partial entry left at the end of
    /// the file is cut off before appending. Returns how many were written.
    pub async fn append(&self, blocks: &[u64]) -> Result<usize, CacheError> {
        let path = self.path();
        let io_error = |source: std::io::Error| CacheError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let _lock = self.cache.lock_waiting(&path, Access::WriteCreate).await?;
        let tail = read_tail(&path).map_err(io_error)?;

        let mut fresh: Vec<u64> = blocks
            .iter()
            .copied()
            .filter(|&n| tail.map_or(true, |t| n > t))
            .collect();
        fresh.sort_unstable();
        fresh.dedup();
        if fresh.is_empty() {
            return Ok(0);
        }

        let bytes: Vec<u8> = fresh.iter().flat_map(|n| n.to_le_bytes()).collect();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error)?;

        let len = file.metadata().map_err(io_error)?.len();
        let trailing = len % ENTRY_SIZE as u64;
        if trailing != 0 {
            warn!(path = %path.display(), trailing, "truncating partial entry before append");
            file.set_len(len - trailing).map_err(io_error)?;
        }
        file.write_all(&bytes).map_err(io_error)?;

        debug!(appended = fresh.len(), latest = fresh[fresh.len() - 1], "extended full index");
        Ok(fresh.len())
    }
}

/// Position of the first entry `>= start`.
pub fn position(index: &[u64], start: u64) -> usize {
    index.partition_point(|&n| n < start)
}

/// Last complete entry of the file, or None when absent or shorter than one
/// entry.
fn read_tail(path: &Path) -> std::io::Result<Option<u64>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let len = file.metadata()?.len();
    let complete = len - len % ENTRY_SIZE as u64;
    if complete == 0 {
        return Ok(None);
    }

    file.seek(SeekFrom::Start(complete - ENTRY_SIZE as u64))?;
    let mut buf = [0u8; ENTRY_SIZE];
    file.read_exact(&mut buf)?;
    Ok(Some(u64::from_le_bytes(buf)))
}

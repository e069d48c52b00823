//! Binary block cache
//!
//! Entities are serialized with postcard into the sharded layout from
//! `paths`. Writes take an exclusive create lock, write to a sibling temp file
//! and link it into place, so a reader never observes a half-written file and
//! a file, once written, is never replaced.
//! Reads take a shared lock and report missing files, lock contention and
//! corrupt contents as distinct errors.

use crate::lock::{Access, FileLock, LockMode, LockRegistry};
use crate::paths::CachePaths;
use crate::records::Block;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failures of the on-disk stores.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Expected file is absent. Usually a cache miss, not a failure.
    #[error("cache file not found: {}", .0.display())]
    Missing(PathBuf),

    /// The file is locked by a writer.
    #[error("could not lock {}: {reason}", path.display())]
    LockUnavailable { path: PathBuf, reason: String },

    /// The file exists but does not parse.
    #[error("corrupt cache file {}: {detail}", path.display())]
    Corrupt { path: PathBuf, detail: String },

    /// A range file was addressed by a number that does not start a range.
    #[error("{start} is not aligned to a {width}-block range")]
    UnalignedRange { start: u64, width: u64 },

    /// The file could not be read or written.
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    /// Whether a fallback source may be tried instead of failing.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CacheError::Missing(_) | CacheError::LockUnavailable { .. })
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Default time a blocking lock waits before giving up.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

/// Locked, sharded entity store.
#[derive(Debug, Clone)]
pub struct BinaryCache {
    paths: CachePaths,
    registry: LockRegistry,
    lock_wait: Duration,
}

impl BinaryCache {
    /// Open a cache rooted at `root`, registering locks in the process-wide
    /// registry.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self::with_registry(root, LockRegistry::global())
    }

    /// Open a cache with a private lock registry.
    pub fn with_registry<P: AsRef<Path>>(root: P, registry: LockRegistry) -> Self {
        Self {
            paths: CachePaths::new(root),
            registry,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// Override how long blocking locks wait.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    pub fn lock_wait(&self) -> Duration {
        self.lock_wait
    }

    /// Acquire a lock on a file under this cache.
    pub fn lock(&self, path: &Path, access: Access, mode: LockMode) -> Result<FileLock, CacheError> {
        FileLock::acquire(path, access, mode, self.lock_wait, &self.registry)
    }

    /// Serialize `item` to `path` with postcard.
    pub fn write<T: Serialize>(&self, item: &T, path: &Path) -> Result<(), CacheError> {
        let bytes = postcard::to_allocvec(item).map_err(|e| CacheError::Corrupt {
            path: path.to_path_buf(),
            detail: format!("failed to serialize: {}", e),
        })?;
        self.write_bytes(&bytes, path)
    }

    /// Deserialize a postcard file.
    pub fn read<T: DeserializeOwned>(&self, path: &Path, mode: LockMode) -> Result<T, CacheError> {
        let bytes = self.read_bytes(path, mode)?;
        postcard::from_bytes(&bytes).map_err(|e| CacheError::Corrupt {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Write `item` as pretty JSON.
    pub fn write_json<T: Serialize>(&self, item: &T, path: &Path) -> Result<(), CacheError> {
        let mut text = serde_json::to_string_pretty(item).map_err(|e| CacheError::Corrupt {
            path: path.to_path_buf(),
            detail: format!("failed to serialize: {}", e),
        })?;
        text.push('\n');
        self.write_bytes(text.as_bytes(), path)
    }

    /// Read a JSON file.
    pub fn read_json<T: DeserializeOwned>(
        &self,
        path: &Path,
        mode: LockMode,
    ) -> Result<T, CacheError> {
        let bytes = self.read_bytes(path, mode)?;
        serde_json::from_slice(&bytes).map_err(|e| CacheError::Corrupt {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Whether a non-empty binary file exists for block `num`.
    pub fn has_block(&self, num: u64) -> bool {
        fs::metadata(self.paths.block_bin(num))
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    /// Read block `num` from the binary cache.
    pub fn read_block(&self, num: u64, mode: LockMode) -> Result<Block, CacheError> {
        let path = self.paths.block_bin(num);
        let block: Block = self.read(&path, mode)?;
        if block.number != num {
            return Err(CacheError::Corrupt {
                path,
                detail: format!("holds block {} instead of {}", block.number, num),
            });
        }
        Ok(block)
    }

    /// Write a block to its binary file.
    pub fn write_block(&self, block: &Block) -> Result<PathBuf, CacheError> {
        let path = self.paths.block_bin(block.number);
        self.write(block, &path)?;
        Ok(path)
    }

    /// Write a block to its JSON debug file.
    pub fn write_block_json(&self, block: &Block) -> Result<PathBuf, CacheError> {
        let path = self.paths.block_json(block.number);
        self.write_json(block, &path)?;
        Ok(path)
    }

    /// Read a block from its JSON debug file.
    pub fn read_block_json(&self, num: u64, mode: LockMode) -> Result<Block, CacheError> {
        self.read_json(&self.paths.block_json(num), mode)
    }

    /// Locked create of raw bytes.
    ///
    /// The file appears atomically and an existing file is never replaced;
    /// a writer that finds one reports `LockUnavailable`.
    pub(crate) fn write_bytes(&self, bytes: &[u8], path: &Path) -> Result<(), CacheError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
                debug!(dir = %parent.display(), "created cache folder");
            }
        }

        let _lock = self.lock(path, Access::WriteCreate, LockMode::NoWait)?;

        let tmp = temp_path(path);
        if let Err(e) = fs::write(&tmp, bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(CacheError::io(path, e));
        }
        let linked = fs::hard_link(&tmp, path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(CacheError::LockUnavailable {
                    path: path.to_path_buf(),
                    reason: "already written by another writer".to_string(),
                });
            }
            Err(e) => return Err(CacheError::io(path, e)),
        }

        debug!(path = %path.display(), bytes = bytes.len(), "wrote cache file");
        Ok(())
    }

    /// Locked read of raw bytes.
    pub(crate) fn read_bytes(&self, path: &Path, mode: LockMode) -> Result<Vec<u8>, CacheError> {
        if !path.exists() {
            return Err(CacheError::Missing(path.to_path_buf()));
        }
        let _lock = self.lock(path, Access::ReadOnly, mode)?;
        read_file(path)
    }

    /// Acquire a lock on a file under this cache, yielding to the runtime
    /// while waiting.
    pub async fn lock_waiting(&self, path: &Path, access: Access) -> Result<FileLock, CacheError> {
        FileLock::acquire_waiting(path, access, self.lock_wait, &self.registry).await
    }

    /// Locked read of raw bytes that waits for a writer without blocking the
    /// runtime.
    pub(crate) async fn read_bytes_waiting(&self, path: &Path) -> Result<Vec<u8>, CacheError> {
        if !path.exists() {
            return Err(CacheError::Missing(path.to_path_buf()));
        }
        let _lock = self.lock_waiting(path, Access::ReadOnly).await?;
        read_file(path)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, CacheError> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        // Removed between the existence check and the read
        Err(e) if e.kind() == ErrorKind::NotFound => Err(CacheError::Missing(path.to_path_buf())),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

//! Runtime configuration
//!
//! Holds the node endpoints, cache root and tuning knobs, and prepares the
//! cache root at startup.

use crate::cache::DEFAULT_LOCK_WAIT;
use crate::node::Provider;
use crate::trace::DEFAULT_CEILING;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Block at which receipts start carrying a status field.
pub const DEFAULT_FORK_BLOCK: u64 = 4_370_000;

/// Problems with the environment that make startup impossible.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cache root {} exists but is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("could not create cache root {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache root {} is not writable: {source}", path.display())]
    NotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Settings for a `Session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Node queried for chain data
    pub rpc_url: String,
    /// Optional second node used when the provider is `Remote`
    pub remote_url: Option<String>,
    /// Root of the on-disk cache
    pub cache_root: PathBuf,
    /// Provider used for queries that miss the cache
    pub provider: Provider,
    /// Status fork boundary
    pub fork_block: u64,
    /// Upper bound for trace count discovery
    pub trace_ceiling: u64,
    /// How long blocking locks wait
    pub lock_wait: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            remote_url: None,
            cache_root: PathBuf::from("./cache"),
            provider: Provider::Local,
            fork_block: DEFAULT_FORK_BLOCK,
            trace_ceiling: DEFAULT_CEILING,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }
}

impl NodeConfig {
    /// URL of the node backing `provider`.
    ///
    /// `Remote` uses the remote URL when one is configured.
    pub fn url_for(&self, provider: Provider) -> &str {
        match (provider, &self.remote_url) {
            (Provider::Remote, Some(url)) => url,
            _ => &self.rpc_url,
        }
    }
}

/// Make sure `root` exists and is a writable directory.
pub fn establish_cache_root(root: &Path) -> Result<(), ConfigError> {
    if root.exists() {
        if !root.is_dir() {
            return Err(ConfigError::NotADirectory(root.to_path_buf()));
        }
    } else {
        fs::create_dir_all(root).map_err(|source| ConfigError::Create {
            path: root.to_path_buf(),
            source,
        })?;
        info!(path = %root.display(), "created cache root");
    }

    let probe = root.join(format!(".write-test-{}", std::process::id()));
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)
        .map_err(|source| ConfigError::NotWritable {
            path: root.to_path_buf(),
            source,
        })?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_establish_creates_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("nested").join("cache");

        establish_cache_root(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);

        // Idempotent
        establish_cache_root(&root).unwrap();
    }

    #[test]
    fn test_establish_rejects_file() {
        let file = NamedTempFile::new().unwrap();
        match establish_cache_root(file.path()) {
            Err(ConfigError::NotADirectory(path)) => assert_eq!(path, file.path()),
            other => panic!("expected not-a-directory, got {:?}", other),
        }
    }

    #[test]
    fn test_url_for_provider() {
        let mut config = NodeConfig::default();
        assert_eq!(config.url_for(Provider::Remote), "http://127.0.0.1:8545");

        config.remote_url = Some("https://mainnet.example".to_string());
        assert_eq!(config.url_for(Provider::Remote), "https://mainnet.example");
        assert_eq!(config.url_for(Provider::Local), "http://127.0.0.1:8545");
        assert_eq!(config.fork_block, 4_370_000);
        assert_eq!(config.trace_ceiling, 1 << 30);
    }
}

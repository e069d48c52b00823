//! Cache file layout
//!
//! Every cached entity is addressed by its number. The number is zero-padded
//! to nine decimal digits and the first three digit pairs become shard
//! directories, so a directory never holds more than 1000 files:
//!
//! ```text
//! 123456789 -> <root>/blocks/12/34/56/123456789.bin   (binary block)
//!           -> <root>/12/34/56/123456789.json         (JSON debug form)
//!           -> <root>/blooms/12/34/56/123456789.bin   (bloom array)
//! ```
//!
//! Numbers wider than nine digits keep every digit in the file name, so the
//! mapping stays injective over the whole `u64` range.

use std::path::{Path, PathBuf};

/// Width of the zero-padded number used in file names.
pub const NUMBER_WIDTH: usize = 9;

/// Folder holding binary block files.
pub const BLOCKS_DIR: &str = "blocks";

/// Folder holding bloom arrays.
pub const BLOOMS_DIR: &str = "blooms";

/// File name of the non-empty block index.
pub const FULL_INDEX_FILE: &str = "fullBlocks.bin";

/// Zero-padded decimal form of a number.
pub fn padded(num: u64) -> String {
    format!("{:0width$}", num, width = NUMBER_WIDTH)
}

/// The three shard directory names for a number.
///
/// Format: first, second, third pair of digits of the padded number.
pub fn shard(num: u64) -> [String; 3] {
    let s = padded(num);
    [s[0..2].to_string(), s[2..4].to_string(), s[4..6].to_string()]
}

/// Resolves file locations under a cache root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    /// Create a resolver for the given cache root.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sharded(&self, base: &Path, num: u64) -> PathBuf {
        let [a, b, c] = shard(num);
        base.join(a).join(b).join(c)
    }

    /// Directory holding the binary file for `num`.
    pub fn block_dir(&self, num: u64) -> PathBuf {
        self.sharded(&self.root.join(BLOCKS_DIR), num)
    }

    /// Binary block file for `num`.
    pub fn block_bin(&self, num: u64) -> PathBuf {
        self.block_dir(num).join(format!("{}.bin", padded(num)))
    }

    /// JSON debug file for `num`.
    pub fn block_json(&self, num: u64) -> PathBuf {
        self.sharded(&self.root, num)
            .join(format!("{}.json", padded(num)))
    }

    /// Directory holding the bloom files for the range containing `num`.
    pub fn bloom_dir(&self, num: u64) -> PathBuf {
        self.sharded(&self.root.join(BLOOMS_DIR), num)
    }

    /// Bloom file for the range starting at `num`.
    pub fn bloom_bin(&self, num: u64) -> PathBuf {
        self.bloom_dir(num).join(format!("{}.bin", padded(num)))
    }

    /// Root of the bloom tree.
    pub fn blooms_root(&self) -> PathBuf {
        self.root.join(BLOOMS_DIR)
    }

    /// The non-empty block index.
    pub fn full_index(&self) -> PathBuf {
        self.root.join(FULL_INDEX_FILE)
    }
}

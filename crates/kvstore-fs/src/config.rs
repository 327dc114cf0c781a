//! Tunables for [`crate::FileSystemBackend`].

use std::path::PathBuf;

/// Configuration for the file-system storage backend.
#[derive(Clone, Debug)]
pub struct FsConfig {
    /// Root directory under which every key's file is stored.
    pub root: PathBuf,
    /// Shard files under a two-character prefix directory derived from the
    /// sanitized key.
    pub use_subdirectories: bool,
    /// Maximum number of files read concurrently during `get_all`.
    pub max_concurrent_files: usize,
    /// Maximum number of attempts for a transient I/O failure.
    pub max_retries: u32,
    /// Base delay between retries; actual delay is
    /// `retry_delay_ms * (attempt + 1)`.
    pub retry_delay_ms: u64,
}

impl FsConfig {
    /// Configuration rooted at `root` with the documented defaults.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            use_subdirectories: true,
            max_concurrent_files: 32,
            max_retries: 3,
            retry_delay_ms: 10,
        }
    }
}

//! Configuration structures for Stratum.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::page::PAGE_SIZE;

/// Storage configuration for a file-backed index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the index data file. A sibling `.log` file holds the
    /// next-page-id counter across restarts.
    pub path: PathBuf,
    /// Buffer pool size in number of page frames.
    pub buffer_pool_pages: usize,
    /// K parameter of the LRU-K replacement policy.
    pub replacer_k: usize,
    /// Enable fsync after page writes.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./stratum.db"),
            buffer_pool_pages: 1024,
            replacer_k: 2,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_pages * PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.path, PathBuf::from("./stratum.db"));
        assert_eq!(config.buffer_pool_pages, 1024);
        assert_eq!(config.replacer_k, 2);
        assert!(config.fsync_enabled);
    }

    #[test]
    fn test_storage_config_custom() {
        let config = StorageConfig {
            path: PathBuf::from("/var/lib/stratum/index.db"),
            buffer_pool_pages: 64,
            replacer_k: 3,
            fsync_enabled: false,
        };

        assert_eq!(config.path, PathBuf::from("/var/lib/stratum/index.db"));
        assert_eq!(config.buffer_pool_pages, 64);
        assert_eq!(config.replacer_k, 3);
        assert!(!config.fsync_enabled);
    }

    #[test]
    fn test_buffer_pool_size_bytes() {
        let config = StorageConfig::default();
        assert_eq!(config.buffer_pool_size_bytes(), 1024 * PAGE_SIZE);

        let small = StorageConfig {
            buffer_pool_pages: 16,
            ..Default::default()
        };
        assert_eq!(small.buffer_pool_size_bytes(), 16 * 4096);
    }

    #[test]
    fn test_storage_config_serde_roundtrip() {
        let original = StorageConfig::default();
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StorageConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.path, deserialized.path);
        assert_eq!(original.buffer_pool_pages, deserialized.buffer_pool_pages);
        assert_eq!(original.replacer_k, deserialized.replacer_k);
        assert_eq!(original.fsync_enabled, deserialized.fsync_enabled);
    }
}

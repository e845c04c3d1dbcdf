//! File-backed index wrapper.
//!
//! Wires a [`FileDiskManager`], a buffer pool, and a single-threaded tree
//! into one handle. Opening a fresh file allocates and formats the header
//! page; reopening an existing file restores the next-page-id counter from
//! the disk manager's log region and inherits the stored root. Closing
//! (and dropping) checkpoints the root id, flushes every resident page, and
//! persists the counter.

use std::sync::Arc;
use tracing::{debug, warn};

use stratum_buffer::{BufferPoolConfig, BufferPoolManager, DiskManager};
use stratum_common::key::{IndexKey, KeyComparator, SlotValue};
use stratum_common::page::{PageId, PAGE_SIZE};
use stratum_common::{Result, StorageConfig};

use crate::btree::{create_header_page, BPlusTreeOptions, IndexIterator, LocalBPlusTree};
use crate::disk::{DiskManagerConfig, FileDiskManager};

/// A persistent single-valued ordered index over one data file.
pub struct BPlusTreeIndex<K, V, C>
where
    K: IndexKey,
    V: SlotValue,
    C: KeyComparator<K>,
{
    tree: LocalBPlusTree<K, V, C>,
    pool: Arc<BufferPoolManager>,
    disk: Arc<FileDiskManager>,
}

impl<K, V, C> BPlusTreeIndex<K, V, C>
where
    K: IndexKey,
    V: SlotValue,
    C: KeyComparator<K>,
{
    /// Opens (or creates) an index at `config.path`.
    ///
    /// `options.inherit_file` is derived from the on-disk state: an
    /// existing non-empty file keeps its contents, a fresh file starts
    /// empty.
    pub fn open(config: StorageConfig, comparator: C, options: BPlusTreeOptions) -> Result<Self> {
        let disk = Arc::new(FileDiskManager::new(DiskManagerConfig {
            path: config.path.clone(),
            fsync_enabled: config.fsync_enabled,
        })?);
        let pool = Arc::new(BufferPoolManager::new(
            BufferPoolConfig {
                pool_size: config.buffer_pool_pages,
                replacer_k: config.replacer_k,
            },
            Arc::clone(&disk) as Arc<dyn DiskManager>,
        ));

        let mut options = options;
        if disk.is_initialized() {
            let mut buf = [0u8; 4];
            let read = disk.read_log(&mut buf, 0)?;
            let next = if read == buf.len() {
                PageId(u32::from_le_bytes(buf))
            } else {
                // No counter on record (unclean shutdown): every page of
                // the file has been allocated, so resume past the end.
                debug!(path = %config.path.display(), "no page counter in log, deriving from file size");
                PageId((disk.file_size()? / PAGE_SIZE as u64) as u32)
            };
            pool.set_next_page_id(next);
            options.inherit_file = true;
        } else {
            let header = create_header_page(&pool)?;
            debug_assert_eq!(header, options.header_page_id);
            options.inherit_file = false;
        }

        let tree = LocalBPlusTree::new(Arc::clone(&pool), comparator, options)?;
        Ok(Self { tree, pool, disk })
    }

    /// The underlying tree.
    pub fn tree(&self) -> &LocalBPlusTree<K, V, C> {
        &self.tree
    }

    /// The buffer pool backing the index.
    pub fn pool(&self) -> &BufferPoolManager {
        &self.pool
    }

    /// Inserts a key/value pair; false when the key exists.
    pub fn insert(&self, key: &K, value: &V) -> Result<bool> {
        self.tree.insert(key, value)
    }

    /// Removes a key; false when absent.
    pub fn remove(&self, key: &K) -> Result<bool> {
        self.tree.remove(key)
    }

    /// Point lookup under the default comparator.
    pub fn get_value(&self, key: &K) -> Result<Vec<V>> {
        self.tree.get_value(key)
    }

    /// Lookup under a caller-supplied comparator (e.g. a prefix order).
    pub fn get_value_with<C2: KeyComparator<K>>(&self, key: &K, cmp: &C2) -> Result<Vec<V>> {
        self.tree.get_value_with(key, cmp)
    }

    /// Iterator over the whole index in key order.
    pub fn iter(&self) -> Result<IndexIterator<'_, K, V>> {
        self.tree.begin()
    }

    /// Iterator seated at the last entry with key <= `key`.
    pub fn iter_at(&self, key: &K) -> Result<IndexIterator<'_, K, V>> {
        self.tree.begin_at(key)
    }

    /// True if the index holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        self.tree.is_empty()
    }

    /// Writes all state needed to reopen the index: root id, dirty pages,
    /// and the page allocator counter. Also runs on drop, best effort.
    pub fn checkpoint(&self) -> Result<()> {
        self.tree.checkpoint()?;
        self.pool.flush_all()?;
        self.disk
            .write_log(&self.pool.next_page_id().as_u32().to_le_bytes())?;
        Ok(())
    }

    /// Checkpoints and closes the index, surfacing any error.
    pub fn close(self) -> Result<()> {
        self.checkpoint()
    }
}

impl<K, V, C> Drop for BPlusTreeIndex<K, V, C>
where
    K: IndexKey,
    V: SlotValue,
    C: KeyComparator<K>,
{
    fn drop(&mut self) {
        // An un-closed index still lands on disk, best effort.
        if let Err(e) = self.checkpoint() {
            warn!(error = %e, "failed to persist index state on drop");
        }
    }
}

//! Disk-backed B+ tree index.
//!
//! The index persists fixed-size key/value mappings on paged storage and
//! supports point lookup, ordered range scans, insertion, and deletion.
//! Two variants share the page layouts, guards, and rebalancing logic:
//!
//! - [`BPlusTree`]: the multi-threaded variant. Writers descend with latch
//!   crabbing after an optimistic read-latched attempt; readers use
//!   single-guard descent.
//! - [`LocalBPlusTree`]: the single-threaded variant. Page guards only
//!   manage pinning, the root page id is cached in memory, and nothing is
//!   latched, which makes it the fastest choice for embedded single-writer
//!   use.
//!
//! Page 0 of the backing store is the index header page; it holds the root
//! page id (or the sentinel when the tree is empty).

pub mod iterator;
mod local;
pub mod page;
mod tree;

pub use iterator::IndexIterator;
pub use local::LocalBPlusTree;
pub use tree::BPlusTree;

use stratum_buffer::BufferPoolManager;
use stratum_common::page::PageId;
use stratum_common::Result;

/// Construction parameters shared by both tree variants.
#[derive(Debug, Clone)]
pub struct BPlusTreeOptions {
    /// Identifies the index on disk; not interpreted by the tree.
    pub index_name: String,
    /// Page id of the shared header page (typically 0).
    pub header_page_id: PageId,
    /// Upper bound on leaf slot count; None derives it from the page size.
    pub leaf_max_size: Option<u32>,
    /// Upper bound on internal slot count; None derives it from the page
    /// size.
    pub internal_max_size: Option<u32>,
    /// If true, open over an existing file and reuse the stored root id;
    /// if false, reset the root id to the sentinel.
    pub inherit_file: bool,
}

impl Default for BPlusTreeOptions {
    fn default() -> Self {
        Self {
            index_name: "index".to_string(),
            header_page_id: PageId::HEADER,
            leaf_max_size: None,
            internal_max_size: None,
            inherit_file: false,
        }
    }
}

impl BPlusTreeOptions {
    /// Names the index.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            index_name: name.into(),
            ..Default::default()
        }
    }

    /// Overrides both fanout bounds (handy for forcing deep trees in
    /// tests).
    pub fn with_max_sizes(mut self, leaf: u32, internal: u32) -> Self {
        self.leaf_max_size = Some(leaf);
        self.internal_max_size = Some(internal);
        self
    }

    /// Opens over an existing file, keeping the stored root id.
    pub fn inherit(mut self) -> Self {
        self.inherit_file = true;
        self
    }
}

/// Allocates and formats the index header page.
///
/// Call once on a fresh backing store before constructing a tree; the
/// returned page id is the `header_page_id` to pass in the options.
pub fn create_header_page(pool: &BufferPoolManager) -> Result<PageId> {
    let (page_id, guard) = pool.new_page()?;
    page::HeaderPage::init(&mut guard.data_mut()[..]);
    Ok(page_id)
}

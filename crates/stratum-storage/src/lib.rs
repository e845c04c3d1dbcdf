//! Storage engine for Stratum.
//!
//! This crate provides:
//! - File-backed disk manager with a log region for allocator state
//! - B+ tree page layouts over raw page buffers
//! - The two B+ tree variants (latch-crabbing and single-threaded)
//! - A forward iterator for ordered range scans
//! - A file-backed index wrapper tying disk, pool, and tree together

pub mod btree;
mod disk;
mod index;

pub use btree::{
    create_header_page, BPlusTree, BPlusTreeOptions, IndexIterator, LocalBPlusTree,
};
pub use disk::{DiskManagerConfig, FileDiskManager};
pub use index::BPlusTreeIndex;

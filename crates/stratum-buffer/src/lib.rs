//! Buffer pool management for Stratum.
//!
//! This crate provides the in-memory staging layer between the B+ tree and
//! the disk:
//! - Fixed-size frame pool with pin counting and per-frame latches
//! - LRU-K eviction policy
//! - RAII page guards (pin-only, shared, exclusive)
//! - The disk manager interface the pool issues I/O against

pub mod disk;
mod frame;
mod guard;
mod pool;
mod replacer;

pub use disk::{DiskManager, MemoryDiskManager};
pub use frame::{BufferFrame, FrameId};
pub use guard::{BasicGuard, ReadGuard, WriteGuard};
pub use pool::{BufferPoolConfig, BufferPoolManager, BufferPoolStats};
pub use replacer::{LruKReplacer, Replacer};

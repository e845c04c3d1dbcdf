//! RAII page guards.
//!
//! A guard owns one pin on a frame and, for the latched kinds, the frame
//! latch. Dropping the guard is the only way the pin is given back; the
//! latch is always released before the unpin so an evictor never sees a
//! free frame with a held latch. Guards are move-only values: ownership of
//! the pin and latch transfers with the guard.

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::mem::ManuallyDrop;
use stratum_common::page::{PageId, PAGE_SIZE};

use crate::frame::BufferFrame;
use crate::pool::BufferPoolManager;

type FrameData = Box<[u8; PAGE_SIZE]>;

/// Pin-only guard: keeps the page resident but takes no latch.
///
/// Data access acquires the frame latch transiently per call. This is the
/// guard of the single-threaded tree variant and of the range iterator.
pub struct BasicGuard<'a> {
    pool: &'a BufferPoolManager,
    frame: &'a BufferFrame,
    page_id: PageId,
}

impl<'a> BasicGuard<'a> {
    pub(crate) fn new(
        pool: &'a BufferPoolManager,
        frame: &'a BufferFrame,
        page_id: PageId,
    ) -> Self {
        Self {
            pool,
            frame,
            page_id,
        }
    }

    /// Returns the guarded page id.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Shared view of the page bytes (transient latch).
    pub fn data(&self) -> RwLockReadGuard<'a, FrameData> {
        self.frame.read_data()
    }

    /// Mutable view of the page bytes (transient latch). Marks the frame
    /// dirty.
    pub fn data_mut(&self) -> RwLockWriteGuard<'a, FrameData> {
        self.frame.set_dirty(true);
        self.frame.write_data()
    }
}

impl Drop for BasicGuard<'_> {
    fn drop(&mut self) {
        // The dirty bit was set on the frame directly by data_mut.
        self.pool.unpin_page(self.page_id, false);
    }
}

/// Pin plus a held reader latch on the frame.
pub struct ReadGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    latch: ManuallyDrop<RwLockReadGuard<'a, FrameData>>,
}

impl<'a> ReadGuard<'a> {
    pub(crate) fn new(
        pool: &'a BufferPoolManager,
        frame: &'a BufferFrame,
        page_id: PageId,
    ) -> Self {
        Self {
            pool,
            page_id,
            latch: ManuallyDrop::new(frame.read_data()),
        }
    }

    /// Returns the guarded page id.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Read-only view of the page bytes.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.latch
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        // Latch first, pin second.
        unsafe { ManuallyDrop::drop(&mut self.latch) };
        self.pool.unpin_page(self.page_id, false);
    }
}

/// Pin plus a held writer latch on the frame.
pub struct WriteGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    frame: &'a BufferFrame,
    latch: ManuallyDrop<RwLockWriteGuard<'a, FrameData>>,
}

impl<'a> WriteGuard<'a> {
    pub(crate) fn new(
        pool: &'a BufferPoolManager,
        frame: &'a BufferFrame,
        page_id: PageId,
    ) -> Self {
        Self {
            pool,
            page_id,
            frame,
            latch: ManuallyDrop::new(frame.write_data()),
        }
    }

    /// Returns the guarded page id.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Read-only view of the page bytes.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.latch
    }

    /// Mutable view of the page bytes. Marks the frame dirty.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.frame.set_dirty(true);
        &mut self.latch
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        // Latch first, pin second.
        unsafe { ManuallyDrop::drop(&mut self.latch) };
        self.pool.unpin_page(self.page_id, false);
    }
}

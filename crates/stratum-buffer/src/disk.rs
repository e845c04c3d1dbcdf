//! Disk manager interface consumed by the buffer pool.
//!
//! The pool only needs fixed-size block I/O plus a small out-of-band log
//! region used to persist the next-page-id counter across restarts, so the
//! disk manager is a trait at this seam. The file-backed implementation
//! lives in `stratum-storage`; [`MemoryDiskManager`] here backs tests and
//! the REPL.

use parking_lot::Mutex;
use std::collections::HashMap;
use stratum_common::page::{PageId, PAGE_SIZE};
use stratum_common::Result;

/// Fixed-size block I/O over a backing store.
pub trait DiskManager: Send + Sync {
    /// Fills `buf` with the contents of the page. Reads past the end of the
    /// store zero-fill.
    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()>;

    /// Writes a page and flushes it.
    fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()>;

    /// Reads from the auxiliary log region at `offset`. Returns the number
    /// of bytes read (possibly short).
    fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Overwrites the auxiliary log region from the start.
    fn write_log(&self, buf: &[u8]) -> Result<()>;

    /// Size of the backing store in bytes.
    fn file_size(&self) -> Result<u64>;

    /// True if the backing store held data before this manager opened it.
    fn is_initialized(&self) -> bool;
}

/// In-memory disk manager for tests and throwaway indexes.
pub struct MemoryDiskManager {
    pages: Mutex<HashMap<u32, Box<[u8; PAGE_SIZE]>>>,
    log: Mutex<Vec<u8>>,
}

impl MemoryDiskManager {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Number of pages that have ever been written.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}

impl Default for MemoryDiskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskManager for MemoryDiskManager {
    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let pages = self.pages.lock();
        match pages.get(&page_id.0) {
            Some(data) => buf.copy_from_slice(&data[..]),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut pages = self.pages.lock();
        pages.insert(page_id.0, Box::new(*buf));
        Ok(())
    }

    fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let log = self.log.lock();
        let offset = offset as usize;
        if offset >= log.len() {
            return Ok(0);
        }
        let len = buf.len().min(log.len() - offset);
        buf[..len].copy_from_slice(&log[offset..offset + len]);
        Ok(len)
    }

    fn write_log(&self, buf: &[u8]) -> Result<()> {
        let mut log = self.log.lock();
        log.clear();
        log.extend_from_slice(buf);
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok((self.pages.lock().len() * PAGE_SIZE) as u64)
    }

    fn is_initialized(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_disk_write_read() {
        let dm = MemoryDiskManager::new();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xEF;
        dm.write_page(PageId(3), &data).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        dm.read_page(PageId(3), &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
        assert_eq!(out[PAGE_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_memory_disk_read_missing_zero_fills() {
        let dm = MemoryDiskManager::new();

        let mut out = [0xFFu8; PAGE_SIZE];
        dm.read_page(PageId(9), &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_memory_disk_overwrite() {
        let dm = MemoryDiskManager::new();

        let mut a = [0u8; PAGE_SIZE];
        a[0] = 1;
        dm.write_page(PageId(0), &a).unwrap();

        let mut b = [0u8; PAGE_SIZE];
        b[0] = 2;
        dm.write_page(PageId(0), &b).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        dm.read_page(PageId(0), &mut out).unwrap();
        assert_eq!(out[0], 2);
        assert_eq!(dm.page_count(), 1);
    }

    #[test]
    fn test_memory_disk_log_region() {
        let dm = MemoryDiskManager::new();

        dm.write_log(&42u32.to_le_bytes()).unwrap();

        let mut buf = [0u8; 4];
        let n = dm.read_log(&mut buf, 0).unwrap();
        assert_eq!(n, 4);
        assert_eq!(u32::from_le_bytes(buf), 42);

        // Overwrite semantics: a second write replaces the slot.
        dm.write_log(&7u32.to_le_bytes()).unwrap();
        let n = dm.read_log(&mut buf, 0).unwrap();
        assert_eq!(n, 4);
        assert_eq!(u32::from_le_bytes(buf), 7);
    }

    #[test]
    fn test_memory_disk_log_read_past_end() {
        let dm = MemoryDiskManager::new();
        let mut buf = [0u8; 8];
        assert_eq!(dm.read_log(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn test_memory_disk_not_initialized() {
        let dm = MemoryDiskManager::new();
        assert!(!dm.is_initialized());
        assert_eq!(dm.file_size().unwrap(), 0);
    }
}

//! File-backed disk manager.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use stratum_buffer::DiskManager;
use stratum_common::page::{PageId, PAGE_SIZE};
use stratum_common::Result;

/// Configuration for the file disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Path to the data file.
    pub path: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./stratum.db"),
            fsync_enabled: true,
        }
    }
}

/// Manages page reads and writes over a single data file, plus a small
/// sibling log file that persists the next-page-id counter across restarts.
///
/// Reads past the end of the file zero-fill; hard I/O errors are logged and
/// propagated.
pub struct FileDiskManager {
    config: DiskManagerConfig,
    db: Mutex<File>,
    log: Mutex<File>,
    initialized: bool,
}

impl FileDiskManager {
    /// Opens or creates the data file and its sibling log file.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        let db = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.path)?;
        let initialized = db.metadata()?.len() > 0;

        let log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(Self::log_path(&config.path))?;

        Ok(Self {
            config,
            db: Mutex::new(db),
            log: Mutex::new(log),
            initialized,
        })
    }

    /// Opens a disk manager at `path` with default settings.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::new(DiskManagerConfig {
            path: path.into(),
            ..Default::default()
        })
    }

    /// Returns the data file path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn log_path(path: &Path) -> PathBuf {
        path.with_extension("log")
    }
}

impl DiskManager for FileDiskManager {
    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let mut db = self.db.lock();
        let offset = page_id.0 as u64 * PAGE_SIZE as u64;
        let file_len = db.metadata()?.len();

        if offset >= file_len {
            debug!(page_id = %page_id, "read past end of file, zero-filling");
            buf.fill(0);
            return Ok(());
        }

        db.seek(SeekFrom::Start(offset))?;
        let mut read_total = 0;
        while read_total < PAGE_SIZE {
            match db.read(&mut buf[read_total..]) {
                Ok(0) => break,
                Ok(n) => read_total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(page_id = %page_id, error = %e, "I/O error while reading page");
                    return Err(e.into());
                }
            }
        }
        if read_total < PAGE_SIZE {
            debug!(page_id = %page_id, read = read_total, "short page read, zero-filling tail");
            buf[read_total..].fill(0);
        }
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut db = self.db.lock();
        let offset = page_id.0 as u64 * PAGE_SIZE as u64;

        db.seek(SeekFrom::Start(offset))?;
        if let Err(e) = db.write_all(buf) {
            error!(page_id = %page_id, error = %e, "I/O error while writing page");
            return Err(e.into());
        }
        if self.config.fsync_enabled {
            db.sync_all()?;
        }
        Ok(())
    }

    fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut log = self.log.lock();
        let len = log.metadata()?.len();
        if offset >= len {
            return Ok(0);
        }
        log.seek(SeekFrom::Start(offset))?;
        let mut read_total = 0;
        while read_total < buf.len() {
            match log.read(&mut buf[read_total..]) {
                Ok(0) => break,
                Ok(n) => read_total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(read_total)
    }

    fn write_log(&self, buf: &[u8]) -> Result<()> {
        let mut log = self.log.lock();
        log.seek(SeekFrom::Start(0))?;
        log.write_all(buf)?;
        log.set_len(buf.len() as u64)?;
        if self.config.fsync_enabled {
            log.sync_all()?;
        }
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.db.lock().metadata()?.len())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk() -> (FileDiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            path: dir.path().join("test.db"),
            fsync_enabled: false,
        };
        let dm = FileDiskManager::new(config).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_disk_write_read() {
        let (dm, _dir) = create_test_disk();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xEF;
        dm.write_page(PageId(0), &data).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        dm.read_page(PageId(0), &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
        assert_eq!(out[PAGE_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_disk_read_past_eof_zero_fills() {
        let (dm, _dir) = create_test_disk();

        let mut out = [0xFFu8; PAGE_SIZE];
        dm.read_page(PageId(42), &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disk_sparse_write_extends_file() {
        let (dm, _dir) = create_test_disk();

        let data = [0x11u8; PAGE_SIZE];
        dm.write_page(PageId(3), &data).unwrap();
        assert_eq!(dm.file_size().unwrap(), 4 * PAGE_SIZE as u64);

        // Hole pages read as zero.
        let mut out = [0xFFu8; PAGE_SIZE];
        dm.read_page(PageId(1), &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disk_overwrite_page() {
        let (dm, _dir) = create_test_disk();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAA;
        dm.write_page(PageId(0), &data).unwrap();
        data[0] = 0xBB;
        dm.write_page(PageId(0), &data).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        dm.read_page(PageId(0), &mut out).unwrap();
        assert_eq!(out[0], 0xBB);
    }

    #[test]
    fn test_disk_initialized_probe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("probe.db");

        {
            let dm = FileDiskManager::open(&path).unwrap();
            assert!(!dm.is_initialized());
            dm.write_page(PageId(0), &[1u8; PAGE_SIZE]).unwrap();
        }

        let dm = FileDiskManager::open(&path).unwrap();
        assert!(dm.is_initialized());
    }

    #[test]
    fn test_disk_log_region_roundtrip() {
        let (dm, _dir) = create_test_disk();

        dm.write_log(&123u32.to_le_bytes()).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(dm.read_log(&mut buf, 0).unwrap(), 4);
        assert_eq!(u32::from_le_bytes(buf), 123);

        // The slot is overwritten, not appended.
        dm.write_log(&456u32.to_le_bytes()).unwrap();
        assert_eq!(dm.read_log(&mut buf, 0).unwrap(), 4);
        assert_eq!(u32::from_le_bytes(buf), 456);
    }

    #[test]
    fn test_disk_log_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counter.db");

        {
            let dm = FileDiskManager::open(&path).unwrap();
            dm.write_log(&99u32.to_le_bytes()).unwrap();
        }

        let dm = FileDiskManager::open(&path).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(dm.read_log(&mut buf, 0).unwrap(), 4);
        assert_eq!(u32::from_le_bytes(buf), 99);
    }

    #[test]
    fn test_disk_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");

        {
            let dm = FileDiskManager::open(&path).unwrap();
            let mut data = [0u8; PAGE_SIZE];
            data[7] = 0x77;
            dm.write_page(PageId(2), &data).unwrap();
        }

        let dm = FileDiskManager::open(&path).unwrap();
        let mut out = [0u8; PAGE_SIZE];
        dm.read_page(PageId(2), &mut out).unwrap();
        assert_eq!(out[7], 0x77);
    }
}

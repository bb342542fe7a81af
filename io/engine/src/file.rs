//! File-backed engine using positional reads and writes.
//!
//! The file is preallocated to the full capacity at open. Each operation is
//! a single `pread`/`pwrite`; `sync` maps to `fdatasync`. Contents are not
//! trusted across restarts - the cache treats the region as empty on
//! construction regardless of what the file held before.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{IoEngine, check_range};

/// Engine over a preallocated file.
pub struct FileEngine {
    file: File,
    capacity: u64,
    shutdown: AtomicBool,
}

impl FileEngine {
    /// Open (or create) `path` and size it to `capacity` bytes.
    pub fn open(path: impl AsRef<Path>, capacity: u64) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(capacity)?;

        Ok(Self {
            file,
            capacity,
            shutdown: AtomicBool::new(false),
        })
    }
}

impl IoEngine for FileEngine {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        check_range(self.capacity, offset, buf.len())?;
        self.file.read_exact_at(buf, offset)
    }

    fn write(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        check_range(self.capacity, offset, buf.len())?;
        self.file.write_all_at(buf, offset)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            let _ = self.file.sync_data();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let engine = FileEngine::open(dir.path().join("cache.dat"), 64 * 1024).unwrap();

        let data: Vec<u8> = (0..8192).map(|i| (i % 239) as u8).collect();
        engine.write(&data, 16 * 1024).unwrap();
        engine.sync().unwrap();

        let mut out = vec![0u8; data.len()];
        engine.read(&mut out, 16 * 1024).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b/cache.dat");
        let engine = FileEngine::open(&nested, 4 * 1024).unwrap();
        assert_eq!(engine.capacity(), 4 * 1024);
        assert!(nested.exists());
    }

    #[test]
    fn test_out_of_range() {
        let dir = tempdir().unwrap();
        let engine = FileEngine::open(dir.path().join("cache.dat"), 4 * 1024).unwrap();
        let buf = [0u8; 64];
        assert!(engine.write(&buf, 4 * 1024).is_err());
    }

    #[test]
    fn test_shutdown_idempotent() {
        let dir = tempdir().unwrap();
        let engine = FileEngine::open(dir.path().join("cache.dat"), 4 * 1024).unwrap();
        engine.shutdown();
        engine.shutdown();
    }
}

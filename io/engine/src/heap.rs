//! Process-heap engine backed by an array of fixed-size buffers.
//!
//! The capacity is split across equally-sized buffers so that very large
//! regions are not a single giant allocation. Reads and writes may span
//! buffer boundaries and are copied chunk by chunk.

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::io;

use crate::{IoEngine, check_range};

/// Alignment for each buffer allocation.
const BUFFER_ALIGN: usize = 4096;

/// One fixed-size heap buffer.
struct Buffer {
    ptr: *mut u8,
    layout: Layout,
}

impl Buffer {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, BUFFER_ALIGN).expect("buffer layout");
        // Zeroed so that a read of a never-written range returns zeros
        // rather than arbitrary heap contents.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        Self { ptr, layout }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout in `new` and has not
        // been deallocated yet.
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

/// Heap-backed engine.
///
/// `sync` is a no-op: heap contents are as durable as they will ever be.
pub struct HeapEngine {
    buffers: Vec<Buffer>,
    buffer_size: usize,
    capacity: u64,
}

// SAFETY: HeapEngine is safe to send/share between threads because:
// 1. Buffer pointers are allocated once at construction and never move or
//    get freed until Drop.
// 2. The engine never mutates its own fields after construction; all byte
//    traffic goes through raw-pointer copies into caller-provided slices.
// 3. Races on overlapping ranges are excluded by the caller's contract
//    (see crate docs), not by the engine.
unsafe impl Send for HeapEngine {}
unsafe impl Sync for HeapEngine {}

impl HeapEngine {
    /// Create an engine of `capacity` bytes split into `buffer_size` chunks.
    ///
    /// The allocation rounds up to a whole number of buffers; `capacity()`
    /// still reports the requested value and out-of-range access checks use
    /// it.
    pub fn new(capacity: u64, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be non-zero");
        assert!(capacity > 0, "capacity must be non-zero");
        let count = capacity.div_ceil(buffer_size as u64) as usize;
        let buffers = (0..count).map(|_| Buffer::new(buffer_size)).collect();
        Self {
            buffers,
            buffer_size,
            capacity,
        }
    }

    /// Size of each backing buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of backing buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Visit the `(buffer, offset-in-buffer, length)` chunks covering
    /// `offset..offset + len`.
    fn for_each_chunk(
        &self,
        offset: u64,
        len: usize,
        mut f: impl FnMut(&Buffer, usize, usize, usize),
    ) {
        let mut pos = offset as usize;
        let mut remaining = len;
        let mut copied = 0;
        while remaining > 0 {
            let idx = pos / self.buffer_size;
            let within = pos % self.buffer_size;
            let chunk = remaining.min(self.buffer_size - within);
            f(&self.buffers[idx], within, copied, chunk);
            pos += chunk;
            copied += chunk;
            remaining -= chunk;
        }
    }
}

impl IoEngine for HeapEngine {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        check_range(self.capacity, offset, buf.len())?;
        self.for_each_chunk(offset, buf.len(), |buffer, within, copied, chunk| {
            // SAFETY: within + chunk <= buffer_size by construction of the
            // chunk iteration, and the destination range is in bounds of
            // `buf`.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buffer.ptr.add(within),
                    buf.as_mut_ptr().add(copied),
                    chunk,
                );
            }
        });
        Ok(())
    }

    fn write(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        check_range(self.capacity, offset, buf.len())?;
        self.for_each_chunk(offset, buf.len(), |buffer, within, copied, chunk| {
            // SAFETY: as in `read`, chunk bounds are maintained by
            // `for_each_chunk`; concurrent writers to the same range are
            // excluded by the caller's contract.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buf.as_ptr().add(copied),
                    buffer.ptr.add(within),
                    chunk,
                );
            }
        });
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&self) {
        // Nothing to release early; buffers go with Drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let engine = HeapEngine::new(64 * 1024, 16 * 1024);
        let data: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();

        engine.write(&data, 8192).unwrap();

        let mut out = vec![0u8; data.len()];
        engine.read(&mut out, 8192).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_unwritten_reads_zero() {
        let engine = HeapEngine::new(16 * 1024, 4 * 1024);
        let mut out = vec![0xffu8; 512];
        engine.read(&mut out, 1024).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_spanning_buffers() {
        // 4KB buffers, write 10KB starting 1KB before a boundary: the write
        // covers parts of three buffers.
        let engine = HeapEngine::new(64 * 1024, 4 * 1024);
        assert_eq!(engine.buffer_count(), 16);

        let data: Vec<u8> = (0..10 * 1024).map(|i| (i % 199) as u8).collect();
        engine.write(&data, 3 * 1024).unwrap();

        let mut out = vec![0u8; data.len()];
        engine.read(&mut out, 3 * 1024).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_capacity_not_buffer_rounded() {
        // 10KB capacity with 4KB buffers allocates 3 buffers but still
        // rejects access past 10KB.
        let engine = HeapEngine::new(10 * 1024, 4 * 1024);
        assert_eq!(engine.capacity(), 10 * 1024);
        assert_eq!(engine.buffer_count(), 3);

        let buf = [0u8; 1024];
        assert!(engine.write(&buf, 9 * 1024).is_ok());
        assert!(engine.write(&buf, 10 * 1024 - 512).is_err());
    }

    #[test]
    fn test_out_of_range() {
        let engine = HeapEngine::new(4 * 1024, 4 * 1024);
        let mut buf = [0u8; 8];
        assert!(engine.read(&mut buf, 4 * 1024).is_err());
        assert!(engine.write(&buf, u64::MAX).is_err());
    }

    #[test]
    fn test_sync_and_shutdown_are_noops() {
        let engine = HeapEngine::new(4 * 1024, 4 * 1024);
        assert!(engine.sync().is_ok());
        engine.shutdown();
        engine.shutdown();
    }
}

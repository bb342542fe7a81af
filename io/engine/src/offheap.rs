//! Off-heap engine backed by a single anonymous memory mapping.
//!
//! Keeps cache payloads out of the allocator-managed heap. The mapping is
//! created once at construction and unmapped on drop.

use std::io;

use memmap2::MmapMut;

use crate::{IoEngine, check_range};

/// Anonymous-mmap engine.
///
/// `sync` is a no-op: there is no backing store to order against.
pub struct OffheapEngine {
    /// Base pointer into the mapping; valid for the mapping's lifetime.
    base: *mut u8,
    /// The mapping itself, held only to keep the region alive until Drop.
    _mmap: MmapMut,
    capacity: u64,
}

// SAFETY: OffheapEngine is safe to send/share between threads because:
// 1. The mapping is created once and never moves or gets unmapped until
//    Drop.
// 2. All access goes through `base` with bounds checked against capacity.
// 3. Races on overlapping ranges are excluded by the caller's contract.
unsafe impl Send for OffheapEngine {}
unsafe impl Sync for OffheapEngine {}

impl OffheapEngine {
    /// Map an anonymous region of `capacity` bytes.
    pub fn new(capacity: u64) -> io::Result<Self> {
        let mut mmap = MmapMut::map_anon(capacity as usize)?;
        let base = mmap.as_mut_ptr();
        Ok(Self {
            base,
            _mmap: mmap,
            capacity,
        })
    }
}

impl IoEngine for OffheapEngine {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        check_range(self.capacity, offset, buf.len())?;
        // SAFETY: the range is within the mapping; the mapping outlives the
        // call.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    fn write(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        check_range(self.capacity, offset, buf.len())?;
        // SAFETY: as in `read`; concurrent writers to the same range are
        // excluded by the caller's contract.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.base.add(offset as usize), buf.len());
        }
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&self) {
        // The mapping is released on Drop.
    }
}

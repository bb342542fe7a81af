//! Cache entries: staged (RAM) and persisted (bucket) records.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use bytes::Bytes;
use io_engine::IoEngine;

use crate::allocator::BucketAllocator;
use crate::error::StoreError;
use crate::key::BlockKey;

/// Required alignment of every persisted offset. Offsets are stored divided
/// by this, so the compact encoding can only express aligned positions.
pub(crate) const OFFSET_ALIGNMENT: u64 = 256;

/// Largest encodable offset factor: 40 bits of `offset / 256`.
const OFFSET_FIELD_MAX: u64 = (1 << 40) - 1;

/// Eviction priority of a persisted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockPriority {
    /// Accessed exactly once since admission.
    Single = 0,
    /// Accessed more than once.
    Multi = 1,
    /// Admitted with `in_memory`; evicted only when the other priorities
    /// cannot meet their free goals.
    Memory = 2,
}

impl BlockPriority {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BlockPriority::Single,
            1 => BlockPriority::Multi,
            _ => BlockPriority::Memory,
        }
    }
}

/// A block staged in RAM, waiting for a writer thread to persist it.
///
/// Lives from admission until the owning worker commits or drops it.
#[derive(Debug)]
pub(crate) struct RamEntry {
    key: BlockKey,
    data: Bytes,
    access_seq: AtomicU64,
    in_memory: bool,
    /// Whether the entry was hit while staged. A staged hit counts as a
    /// re-access, so the persisted record starts at MULTI priority.
    accessed: AtomicBool,
}

impl RamEntry {
    pub(crate) fn new(key: BlockKey, data: Bytes, access_seq: u64, in_memory: bool) -> Self {
        Self {
            key,
            data,
            access_seq: AtomicU64::new(access_seq),
            in_memory,
            accessed: AtomicBool::new(false),
        }
    }

    pub(crate) fn key(&self) -> &BlockKey {
        &self.key
    }

    pub(crate) fn data(&self) -> &Bytes {
        &self.data
    }

    /// Record a hit against the staged entry.
    pub(crate) fn access(&self, access_seq: u64) {
        self.access_seq.store(access_seq, Ordering::Relaxed);
        self.accessed.store(true, Ordering::Relaxed);
    }

    /// Priority the persisted record will carry.
    fn priority(&self) -> BlockPriority {
        if self.in_memory {
            BlockPriority::Memory
        } else if self.accessed.load(Ordering::Relaxed) {
            BlockPriority::Multi
        } else {
            BlockPriority::Single
        }
    }

    /// Allocate a slot, write the payload, and build the persisted record.
    ///
    /// On a write failure the allocated slot is freed before returning; the
    /// caller never has to clean up a partial store. `real_cache_size` is
    /// credited only on success.
    pub(crate) fn write_to_cache(
        &self,
        engine: &dyn IoEngine,
        allocator: &BucketAllocator,
        real_cache_size: &AtomicU64,
    ) -> Result<BucketEntry, StoreError> {
        let len = self.data.len();
        let offset = allocator.allocate(len)?;
        if let Err(e) = engine.write(&self.data, offset) {
            allocator.free(offset);
            return Err(StoreError::Io(e));
        }
        let entry = BucketEntry::new(
            offset,
            len as u32,
            self.access_seq.load(Ordering::Relaxed),
            self.priority(),
        );
        real_cache_size.fetch_add(len as u64, Ordering::Relaxed);
        Ok(entry)
    }
}

/// Compact descriptor of a persisted block, held in the backing map.
///
/// We expect this to be where most index memory goes, so the offset is
/// stored as a 40-bit field times 256 (5 bytes addressing 256 TiB). The
/// re-check-under-lock protocol compares entries by `Arc` identity, never
/// by value.
#[derive(Debug)]
pub(crate) struct BucketEntry {
    offset_base: u32,
    offset_hi: u8,
    length: u32,
    access_seq: AtomicU64,
    priority: AtomicU8,
}

impl BucketEntry {
    /// Build a record for a block written at `offset`.
    ///
    /// Panics if `offset` is not 256-byte aligned or does not fit the
    /// 40-bit field; the allocator only hands out aligned offsets, so a
    /// violation is a corrupted offset.
    pub(crate) fn new(offset: u64, length: u32, access_seq: u64, priority: BlockPriority) -> Self {
        assert!(
            offset % OFFSET_ALIGNMENT == 0,
            "bucket entry offset {offset} is not {OFFSET_ALIGNMENT}-byte aligned"
        );
        let scaled = offset / OFFSET_ALIGNMENT;
        assert!(
            scaled <= OFFSET_FIELD_MAX,
            "bucket entry offset {offset} exceeds the encodable range"
        );
        Self {
            offset_base: scaled as u32,
            offset_hi: (scaled >> 32) as u8,
            length,
            access_seq: AtomicU64::new(access_seq),
            priority: AtomicU8::new(priority as u8),
        }
    }

    /// Byte position of the block in the engine.
    pub(crate) fn offset(&self) -> u64 {
        let scaled = u64::from(self.offset_base) | (u64::from(self.offset_hi) << 32);
        scaled * OFFSET_ALIGNMENT
    }

    /// Exact payload length in bytes.
    pub(crate) fn length(&self) -> u32 {
        self.length
    }

    /// Last access sequence number.
    pub(crate) fn access_seq(&self) -> u64 {
        self.access_seq.load(Ordering::Relaxed)
    }

    /// Record an access: update recency and promote SINGLE to MULTI.
    pub(crate) fn access(&self, access_seq: u64) {
        self.access_seq.store(access_seq, Ordering::Relaxed);
        // MEMORY never demotes and MULTI is terminal, so a plain
        // compare-and-store on SINGLE is sufficient.
        let _ = self.priority.compare_exchange(
            BlockPriority::Single as u8,
            BlockPriority::Multi as u8,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    pub(crate) fn priority(&self) -> BlockPriority {
        BlockPriority::from_u8(self.priority.load(Ordering::Relaxed))
    }
}

//! Size-classed bucket allocator over the engine's byte region.
//!
//! The region is carved into equally-sized buckets. Each bucket is assigned
//! one size class at runtime and holds `bucket_capacity / item_size` fixed
//! slots, tracked through a per-bucket free-slot stack. A class that runs
//! out of slots may take over a completely-free bucket from another class
//! and reconfigure it.
//!
//! `used_size` accounts whole slots: an allocation of `len` bytes consumes
//! `item_size` bytes of the region, where `item_size` is the smallest class
//! that fits `len`.

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::error::{AllocatorError, ConfigError};

/// Every bucket holds at least this many slots of the largest size class.
const FEWEST_ITEMS_IN_BUCKET: u64 = 4;

/// Per-class occupancy statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStatistics {
    /// Slot size of this class in bytes.
    pub item_size: u32,
    /// Total slots across the class's buckets.
    pub total_count: u64,
    /// Occupied slots.
    pub used_count: u64,
    /// Free slots.
    pub free_count: u64,
}

/// A fixed-size region of the engine, carved into slots of one size class.
#[derive(Debug)]
struct Bucket {
    base_offset: u64,
    item_size: u32,
    /// Index of the owning size class.
    class: usize,
    /// LIFO stack of free slot indices.
    free_slots: Vec<u32>,
    used_count: u32,
}

impl Bucket {
    fn new(base_offset: u64) -> Self {
        Self {
            base_offset,
            item_size: 0,
            class: 0,
            free_slots: Vec::new(),
            used_count: 0,
        }
    }

    /// Reassign the bucket to a class, resetting its slots.
    ///
    /// Only legal while the bucket is completely free.
    fn reconfigure(&mut self, class: usize, item_size: u32, bucket_capacity: u64) {
        assert_eq!(self.used_count, 0, "reconfiguring a bucket with live slots");
        let slots = (bucket_capacity / u64::from(item_size)) as u32;
        self.class = class;
        self.item_size = item_size;
        self.free_slots = (0..slots).rev().collect();
        self.used_count = 0;
    }

    fn allocate(&mut self) -> Option<u64> {
        let slot = self.free_slots.pop()?;
        self.used_count += 1;
        Some(self.base_offset + u64::from(slot) * u64::from(self.item_size))
    }

    fn free(&mut self, offset: u64) {
        let relative = offset - self.base_offset;
        assert!(
            relative % u64::from(self.item_size) == 0,
            "freed offset {offset} is not slot-aligned in its bucket"
        );
        assert!(self.used_count > 0, "freeing into an empty bucket");
        let slot = (relative / u64::from(self.item_size)) as u32;
        debug_assert!(
            !self.free_slots.contains(&slot),
            "double free of offset {offset}"
        );
        self.free_slots.push(slot);
        self.used_count -= 1;
    }

    fn has_free_slot(&self) -> bool {
        !self.free_slots.is_empty()
    }

    fn is_completely_free(&self) -> bool {
        self.used_count == 0
    }

    fn slot_count(&self) -> u64 {
        u64::from(self.used_count) + self.free_slots.len() as u64
    }
}

/// Membership bookkeeping for one size class.
#[derive(Debug)]
struct SizeClass {
    item_size: u32,
    /// Buckets of this class with at least one free slot.
    free_buckets: BTreeSet<usize>,
}

#[derive(Debug)]
struct AllocatorState {
    buckets: Vec<Bucket>,
    classes: Vec<SizeClass>,
    /// Buckets with no live slots, eligible for class reassignment.
    completely_free: BTreeSet<usize>,
    used_size: u64,
}

/// The bucket allocator.
///
/// All mutation happens under one internal lock; allocation and free are a
/// stack pop/push plus set maintenance.
#[derive(Debug)]
pub(crate) struct BucketAllocator {
    sizes: Vec<u32>,
    bucket_capacity: u64,
    total_size: u64,
    state: Mutex<AllocatorState>,
}

impl BucketAllocator {
    /// Carve `capacity` bytes into buckets of `FEWEST_ITEMS_IN_BUCKET`
    /// times the largest class, assigning classes round-robin.
    ///
    /// `sizes` must already be validated (non-empty, strictly increasing,
    /// 256-aligned).
    pub(crate) fn new(sizes: &[u32], capacity: u64) -> Result<Self, ConfigError> {
        let largest = *sizes.last().expect("validated size classes");
        let bucket_capacity = FEWEST_ITEMS_IN_BUCKET * u64::from(largest);
        let bucket_count = capacity / bucket_capacity;
        if bucket_count == 0 {
            return Err(ConfigError::CapacityTooSmall {
                capacity,
                bucket_capacity,
            });
        }

        let mut classes: Vec<SizeClass> = sizes
            .iter()
            .map(|&item_size| SizeClass {
                item_size,
                free_buckets: BTreeSet::new(),
            })
            .collect();

        let mut buckets = Vec::with_capacity(bucket_count as usize);
        let mut completely_free = BTreeSet::new();
        for i in 0..bucket_count as usize {
            let mut bucket = Bucket::new(i as u64 * bucket_capacity);
            let class = i % classes.len();
            bucket.reconfigure(class, classes[class].item_size, bucket_capacity);
            classes[class].free_buckets.insert(i);
            completely_free.insert(i);
            buckets.push(bucket);
        }

        Ok(Self {
            sizes: sizes.to_vec(),
            bucket_capacity,
            total_size: bucket_count * bucket_capacity,
            state: Mutex::new(AllocatorState {
                buckets,
                classes,
                completely_free,
                used_size: 0,
            }),
        })
    }

    /// Smallest class index whose slot size covers `len`.
    fn select_class(&self, len: usize) -> Option<usize> {
        let len = u32::try_from(len).ok()?;
        match self.sizes.binary_search(&len) {
            Ok(idx) => Some(idx),
            Err(idx) if idx < self.sizes.len() => Some(idx),
            Err(_) => None,
        }
    }

    /// Assign a byte range for a block of `len` bytes.
    ///
    /// Returns the offset of a slot in the smallest class that fits. If the
    /// class has no free slot, a completely-free bucket of another class is
    /// converted; failing that, [`AllocatorError::NoSpaceInSizeClass`]. A
    /// length above the largest class is [`AllocatorError::CacheFull`].
    pub(crate) fn allocate(&self, len: usize) -> Result<u64, AllocatorError> {
        let class_idx = self
            .select_class(len)
            .ok_or(AllocatorError::CacheFull { size: len })?;

        let mut st = self.state.lock();
        let bucket_idx = match st.classes[class_idx].free_buckets.iter().next().copied() {
            Some(idx) => idx,
            None => {
                let idx = st
                    .completely_free
                    .iter()
                    .next()
                    .copied()
                    .ok_or(AllocatorError::NoSpaceInSizeClass { size: len })?;
                let old_class = st.buckets[idx].class;
                st.classes[old_class].free_buckets.remove(&idx);
                let item_size = st.classes[class_idx].item_size;
                st.buckets[idx].reconfigure(class_idx, item_size, self.bucket_capacity);
                st.classes[class_idx].free_buckets.insert(idx);
                idx
            }
        };

        let offset = st.buckets[bucket_idx]
            .allocate()
            .expect("bucket from the free set has a slot");
        let item_size = u64::from(st.buckets[bucket_idx].item_size);
        st.completely_free.remove(&bucket_idx);
        if !st.buckets[bucket_idx].has_free_slot() {
            st.classes[class_idx].free_buckets.remove(&bucket_idx);
        }
        st.used_size += item_size;
        Ok(offset)
    }

    /// Return a slot to its bucket's free list.
    ///
    /// Must match a prior `allocate`. A bucket that becomes fully free
    /// stays assigned to its class but becomes eligible for reassignment.
    pub(crate) fn free(&self, offset: u64) {
        let mut st = self.state.lock();
        let bucket_idx = (offset / self.bucket_capacity) as usize;
        assert!(
            bucket_idx < st.buckets.len(),
            "freed offset {offset} is outside the allocator region"
        );
        st.buckets[bucket_idx].free(offset);
        let class = st.buckets[bucket_idx].class;
        let item_size = st.buckets[bucket_idx].item_size;
        st.used_size -= u64::from(item_size);
        st.classes[class].free_buckets.insert(bucket_idx);
        if st.buckets[bucket_idx].is_completely_free() {
            st.completely_free.insert(bucket_idx);
        }
    }

    /// Total bytes managed (a whole number of buckets).
    pub(crate) fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes consumed by occupied slots.
    pub(crate) fn used_size(&self) -> u64 {
        self.state.lock().used_size
    }

    /// Bytes available in unoccupied slots.
    pub(crate) fn free_size(&self) -> u64 {
        self.total_size - self.used_size()
    }

    /// Occupancy statistics per size class.
    pub(crate) fn index_statistics(&self) -> Vec<IndexStatistics> {
        let st = self.state.lock();
        let mut stats: Vec<IndexStatistics> = st
            .classes
            .iter()
            .map(|c| IndexStatistics {
                item_size: c.item_size,
                total_count: 0,
                used_count: 0,
                free_count: 0,
            })
            .collect();
        for bucket in &st.buckets {
            let s = &mut stats[bucket.class];
            s.total_count += bucket.slot_count();
            s.used_count += u64::from(bucket.used_count);
            s.free_count += bucket.free_slots.len() as u64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_allocator() -> BucketAllocator {
        // bucket_capacity = 4 * 16384 = 64KB; 1MB capacity = 16 buckets,
        // round-robin over three classes.
        BucketAllocator::new(&[4096, 8192, 16384], 1024 * 1024).unwrap()
    }

    #[test]
    fn test_construction() {
        let allocator = test_allocator();
        assert_eq!(allocator.total_size(), 1024 * 1024);
        assert_eq!(allocator.used_size(), 0);

        let stats = allocator.index_statistics();
        assert_eq!(stats.len(), 3);
        // 16 buckets round-robin: classes get 6, 5, 5 buckets.
        assert_eq!(stats[0].total_count, 6 * (64 * 1024 / 4096));
        assert_eq!(stats[1].total_count, 5 * (64 * 1024 / 8192));
        assert_eq!(stats[2].total_count, 5 * (64 * 1024 / 16384));
        assert!(stats.iter().all(|s| s.used_count == 0));
    }

    #[test]
    fn test_capacity_too_small() {
        assert!(matches!(
            BucketAllocator::new(&[4096, 16384], 32 * 1024),
            Err(ConfigError::CapacityTooSmall { .. })
        ));
    }

    #[test]
    fn test_allocate_picks_smallest_fitting_class() {
        let allocator = test_allocator();
        allocator.allocate(100).unwrap();
        allocator.allocate(4096).unwrap();
        allocator.allocate(4097).unwrap();

        let stats = allocator.index_statistics();
        assert_eq!(stats[0].used_count, 2);
        assert_eq!(stats[1].used_count, 1);
        assert_eq!(allocator.used_size(), 2 * 4096 + 8192);
    }

    #[test]
    fn test_allocate_free_roundtrip() {
        let allocator = test_allocator();
        let offset = allocator.allocate(4096).unwrap();
        assert_eq!(offset % 256, 0);
        assert_eq!(allocator.used_size(), 4096);

        allocator.free(offset);
        assert_eq!(allocator.used_size(), 0);

        // The slot is reusable.
        let again = allocator.allocate(4096).unwrap();
        assert_eq!(again, offset);
    }

    #[test]
    fn test_no_two_live_allocations_overlap() {
        let allocator = test_allocator();
        let mut ranges = Vec::new();
        while let Ok(offset) = allocator.allocate(4096) {
            ranges.push((offset, offset + 4096));
        }
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "ranges {pair:?} overlap");
        }
    }

    #[test]
    fn test_too_large_is_cache_full() {
        let allocator = test_allocator();
        assert_eq!(
            allocator.allocate(16385),
            Err(AllocatorError::CacheFull { size: 16385 })
        );
    }

    #[test]
    fn test_exhaustion_is_no_space_in_class() {
        let allocator = test_allocator();
        // Consume every slot of every class; completely-free stealing keeps
        // this going until the whole region is occupied.
        while allocator.allocate(16384).is_ok() {}
        assert_eq!(
            allocator.allocate(16384),
            Err(AllocatorError::NoSpaceInSizeClass { size: 16384 })
        );
        assert_eq!(allocator.used_size(), allocator.total_size());
    }

    #[test]
    fn test_completely_free_bucket_stealing() {
        let allocator = test_allocator();
        // Fill class 2 (5 buckets x 4 slots of 16KB).
        let mut held = Vec::new();
        for _ in 0..20 {
            held.push(allocator.allocate(16384).unwrap());
        }
        // Class 2 proper is exhausted; the next allocation converts a
        // completely-free bucket from another class.
        let stolen = allocator.allocate(16384).unwrap();
        let stats = allocator.index_statistics();
        assert_eq!(stats[2].used_count, 21);
        assert!(stats[2].total_count >= 24);

        allocator.free(stolen);
        for offset in held {
            allocator.free(offset);
        }
        assert_eq!(allocator.used_size(), 0);
    }

    #[test]
    fn test_freed_bucket_keeps_its_class() {
        let allocator = test_allocator();
        let offset = allocator.allocate(8192).unwrap();
        let before = allocator.index_statistics();
        allocator.free(offset);
        let after = allocator.index_statistics();
        assert_eq!(before[1].total_count, after[1].total_count);
        assert_eq!(after[1].free_count, after[1].total_count);
    }

    #[test]
    #[should_panic(expected = "not slot-aligned")]
    fn test_misaligned_free_panics() {
        let allocator = test_allocator();
        let offset = allocator.allocate(4096).unwrap();
        allocator.free(offset + 100);
    }
}

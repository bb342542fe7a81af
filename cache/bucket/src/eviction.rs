//! Three-priority LRU-like eviction with proportional freeing targets.
//!
//! `free_space` computes a per-size-class free goal, scans the backing map
//! once grouping entries by priority, and frees the least-recently-accessed
//! entries of each group under a proportional budget. Groups are served in
//! ascending overflow order so lightly-loaded priorities give up less. A
//! second pass over SINGLE and MULTI (never MEMORY) runs if some class is
//! still short of its goal.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::CacheInner;
use crate::allocator::IndexStatistics;
use crate::entry::{BlockPriority, BucketEntry};
use crate::key::BlockKey;

/// Share of the total kept for SINGLE-priority entries.
const SINGLE_FACTOR: f64 = 0.25;
/// Share of the total kept for MULTI-priority entries.
const MULTI_FACTOR: f64 = 0.50;
/// Share of the total kept for MEMORY-priority entries.
const MEMORY_FACTOR: f64 = 0.25;
/// Extra headroom freed beyond the strict goal.
const EXTRA_FREE_FACTOR: f64 = 0.10;

/// Used-size fraction above which a writer triggers a free-space run.
const ACCEPT_FACTOR: f64 = 0.95;
/// Used-size fraction the free-space run drives the cache back down to.
const MIN_FACTOR: f64 = 0.85;

/// Bounded recency queue: retains the oldest entries whose lengths sum to
/// at most `max_size` bytes, discarding the youngest on overflow.
struct CachedEntryQueue {
    /// Keyed by `(access_seq, offset)`; offsets are unique among persisted
    /// entries, which keeps keys distinct even on access-sequence reuse.
    map: BTreeMap<(u64, u64), (BlockKey, Arc<BucketEntry>)>,
    cache_size: u64,
    max_size: u64,
}

impl CachedEntryQueue {
    fn new(max_size: u64) -> Self {
        Self {
            map: BTreeMap::new(),
            cache_size: 0,
            max_size,
        }
    }

    fn add(&mut self, key: BlockKey, entry: Arc<BucketEntry>) {
        let seq = entry.access_seq();
        let len = u64::from(entry.length());
        if self.cache_size < self.max_size {
            self.map.insert((seq, entry.offset()), (key, entry));
            self.cache_size += len;
        } else {
            let youngest_seq = self.map.last_key_value().map(|(&(s, _), _)| s);
            if let Some(youngest_seq) = youngest_seq
                && seq < youngest_seq
            {
                let (_, (_, dropped)) = self.map.pop_last().expect("non-empty queue");
                self.cache_size -= u64::from(dropped.length());
                self.map.insert((seq, entry.offset()), (key, entry));
                self.cache_size += len;
            }
        }
    }

    /// Oldest-first drain order.
    fn pop_oldest(&mut self) -> Option<(BlockKey, Arc<BucketEntry>)> {
        self.map.pop_first().map(|(_, value)| value)
    }
}

/// The entries of one priority, with that priority's byte target.
struct BucketEntryGroup {
    queue: CachedEntryQueue,
    total_size: u64,
    bucket_size: u64,
}

impl BucketEntryGroup {
    fn new(bytes_to_free: u64, bucket_size: u64) -> Self {
        Self {
            queue: CachedEntryQueue::new(bytes_to_free),
            total_size: 0,
            bucket_size,
        }
    }

    fn add(&mut self, key: BlockKey, entry: Arc<BucketEntry>) {
        self.total_size += u64::from(entry.length());
        self.queue.add(key, entry);
    }

    /// Bytes held beyond this group's target. Negative when under target.
    fn overflow(&self) -> i64 {
        self.total_size as i64 - self.bucket_size as i64
    }

    /// Evict oldest entries until `to_free` bytes are covered or the group
    /// runs dry. An entry another thread evicted first still counts toward
    /// the budget.
    fn free(&mut self, to_free: u64, cache: &CacheInner) -> u64 {
        let mut freed = 0u64;
        while let Some((key, entry)) = self.queue.pop_oldest() {
            cache.evict_block(&key);
            freed += u64::from(entry.length());
            if freed >= to_free {
                return freed;
            }
        }
        freed
    }
}

/// Slots each class must keep free: `max(1, total * (1 - MIN_FACTOR))`.
fn free_goal(stats: &IndexStatistics) -> u64 {
    ((stats.total_count as f64 * (1.0 - MIN_FACTOR)).floor() as u64).max(1)
}

impl CacheInner {
    pub(crate) fn acceptable_size(&self) -> u64 {
        (self.allocator.total_size() as f64 * ACCEPT_FACTOR).floor() as u64
    }

    fn single_size(&self) -> u64 {
        (self.allocator.total_size() as f64 * SINGLE_FACTOR * MIN_FACTOR).floor() as u64
    }

    fn multi_size(&self) -> u64 {
        (self.allocator.total_size() as f64 * MULTI_FACTOR * MIN_FACTOR).floor() as u64
    }

    fn memory_size(&self) -> u64 {
        (self.allocator.total_size() as f64 * MEMORY_FACTOR * MIN_FACTOR).floor() as u64
    }

    /// Free space until every size class meets its free goal.
    ///
    /// Re-entry safe: a concurrent call returns immediately when the run
    /// lock is held.
    pub(crate) fn free_space(&self) {
        let Some(_run) = self.free_space_lock.try_lock() else {
            return;
        };
        self.free_in_progress.store(true, Ordering::Release);
        self.free_space_locked();
        self.stats.evict();
        self.free_in_progress.store(false, Ordering::Release);
    }

    fn free_space_locked(&self) {
        let class_stats = self.allocator.index_statistics();
        let mut bytes_to_free = 0u64;
        for stats in &class_stats {
            let goal = free_goal(stats);
            if stats.free_count < goal {
                bytes_to_free += u64::from(stats.item_size) * (goal - stats.free_count);
            }
        }
        if bytes_to_free == 0 {
            return;
        }

        tracing::debug!(
            bytes_to_free,
            used = self.allocator.used_size(),
            cache_size = self.real_cache_size.load(Ordering::Relaxed),
            total = self.allocator.total_size(),
            "bucket cache free space started"
        );

        let bytes_to_free_with_extra =
            (bytes_to_free as f64 * (1.0 + EXTRA_FREE_FACTOR)).floor() as u64;

        let mut groups = [
            BucketEntryGroup::new(bytes_to_free_with_extra, self.single_size()),
            BucketEntryGroup::new(bytes_to_free_with_extra, self.multi_size()),
            BucketEntryGroup::new(bytes_to_free_with_extra, self.memory_size()),
        ];

        // One scan of the whole backing map; admissions racing the scan are
        // not guaranteed to be considered.
        for item in self.backing_map.iter() {
            let entry = item.value().clone();
            let group = match entry.priority() {
                BlockPriority::Single => &mut groups[0],
                BlockPriority::Multi => &mut groups[1],
                BlockPriority::Memory => &mut groups[2],
            };
            group.add(item.key().clone(), entry);
        }

        // Pass 1: all three groups, least overflowing first, each capped at
        // its own overflow and an equal share of what remains.
        let mut order: Vec<usize> = vec![0, 1, 2];
        order.sort_by_key(|&i| groups[i].overflow());
        let mut remaining = order.len() as u64;
        let mut freed = 0u64;
        for idx in order {
            let overflow = groups[idx].overflow();
            if overflow > 0 {
                let budget = (overflow as u64).min(bytes_to_free.saturating_sub(freed) / remaining);
                freed += groups[idx].free(budget, self);
            }
            remaining -= 1;
        }

        // Pass 2: if some class is still short, squeeze SINGLE and MULTI
        // further. MEMORY is spared.
        let class_stats = self.allocator.index_statistics();
        let still_short = class_stats
            .iter()
            .any(|stats| stats.free_count < free_goal(stats));
        if still_short {
            let mut order: Vec<usize> = vec![0, 1];
            order.sort_by_key(|&i| groups[i].overflow());
            let mut remaining = order.len() as u64;
            for idx in order {
                let budget = bytes_to_free_with_extra.saturating_sub(freed) / remaining;
                freed += groups[idx].free(budget, self);
                remaining -= 1;
            }
        }

        tracing::debug!(
            freed,
            total = self.allocator.total_size(),
            single = groups[0].total_size,
            multi = groups[1].total_size,
            memory = groups[2].total_size,
            "bucket cache free space completed"
        );
    }

    /// Remove one block from the cache, staged or persisted.
    ///
    /// Linearizable per key: the persisted branch holds the sparse offset
    /// lock and only removes the backing entry if it is still the same
    /// record that was observed before locking.
    pub(crate) fn evict_block(&self, key: &BlockKey) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let removed_staged = self.ram_cache.remove(key);
        if let Some((_, staged)) = &removed_staged {
            self.block_number.fetch_sub(1, Ordering::Relaxed);
            self.heap_size
                .fetch_sub(staged.data().len() as u64, Ordering::Relaxed);
        }

        let Some(entry) = self.backing_map.get(key).map(|e| e.value().clone()) else {
            return false;
        };

        let _lock = self.offset_lock.lock(entry.offset());
        let Some((_, evicted)) = self
            .backing_map
            .remove_if(key, |_, current| Arc::ptr_eq(current, &entry))
        else {
            return false;
        };

        self.allocator.free(evicted.offset());
        self.real_cache_size
            .fetch_sub(u64::from(evicted.length()), Ordering::Relaxed);
        self.index.remove(key);
        if removed_staged.is_none() {
            self.block_number.fetch_sub(1, Ordering::Relaxed);
        }
        self.stats.evicted(evicted.priority());
        true
    }
}

//! Hit/miss/eviction counters and the periodic stats snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::entry::BlockPriority;

/// Atomic counters for cache operations.
///
/// Hit and miss counters are cumulative. The IO-hit counters form a window
/// that [`BucketCacheStats::reset_window`] clears after each periodic log
/// line, so per-second and per-hit figures describe the last period only.
#[derive(Debug)]
pub(crate) struct BucketCacheStats {
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    hit_caching_count: AtomicU64,
    miss_caching_count: AtomicU64,
    io_hit_count: AtomicU64,
    io_hit_time_ns: AtomicU64,
    eviction_runs: AtomicU64,
    evicted_count: AtomicU64,
    evicted_single: AtomicU64,
    evicted_multi: AtomicU64,
    evicted_memory: AtomicU64,
    window_start: Mutex<Instant>,
}

impl BucketCacheStats {
    pub(crate) fn new() -> Self {
        Self {
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
            hit_caching_count: AtomicU64::new(0),
            miss_caching_count: AtomicU64::new(0),
            io_hit_count: AtomicU64::new(0),
            io_hit_time_ns: AtomicU64::new(0),
            eviction_runs: AtomicU64::new(0),
            evicted_count: AtomicU64::new(0),
            evicted_single: AtomicU64::new(0),
            evicted_multi: AtomicU64::new(0),
            evicted_memory: AtomicU64::new(0),
            window_start: Mutex::new(Instant::now()),
        }
    }

    /// Record a hit. `caching` marks lookups whose caller would cache on a
    /// miss.
    pub(crate) fn hit(&self, caching: bool) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        if caching {
            self.hit_caching_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a miss.
    pub(crate) fn miss(&self, caching: bool) {
        self.miss_count.fetch_add(1, Ordering::Relaxed);
        if caching {
            self.miss_caching_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a hit served from the engine, with its read latency.
    pub(crate) fn io_hit(&self, elapsed: Duration) {
        self.io_hit_count.fetch_add(1, Ordering::Relaxed);
        self.io_hit_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record one completed free-space run.
    pub(crate) fn evict(&self) {
        self.eviction_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one evicted block, tagged with its priority.
    pub(crate) fn evicted(&self, priority: BlockPriority) {
        self.evicted_count.fetch_add(1, Ordering::Relaxed);
        let tagged = match priority {
            BlockPriority::Single => &self.evicted_single,
            BlockPriority::Multi => &self.evicted_multi,
            BlockPriority::Memory => &self.evicted_memory,
        };
        tagged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub(crate) fn miss_count(&self) -> u64 {
        self.miss_count.load(Ordering::Relaxed)
    }

    pub(crate) fn request_count(&self) -> u64 {
        self.hit_count() + self.miss_count()
    }

    pub(crate) fn hit_caching_count(&self) -> u64 {
        self.hit_caching_count.load(Ordering::Relaxed)
    }

    pub(crate) fn request_caching_count(&self) -> u64 {
        self.hit_caching_count() + self.miss_caching_count.load(Ordering::Relaxed)
    }

    pub(crate) fn eviction_runs(&self) -> u64 {
        self.eviction_runs.load(Ordering::Relaxed)
    }

    pub(crate) fn evicted_count(&self) -> u64 {
        self.evicted_count.load(Ordering::Relaxed)
    }

    pub(crate) fn evicted_by_priority(&self) -> (u64, u64, u64) {
        (
            self.evicted_single.load(Ordering::Relaxed),
            self.evicted_multi.load(Ordering::Relaxed),
            self.evicted_memory.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn hit_ratio(&self) -> f64 {
        ratio(self.hit_count(), self.request_count())
    }

    pub(crate) fn caching_hit_ratio(&self) -> f64 {
        ratio(self.hit_caching_count(), self.request_caching_count())
    }

    /// Engine-served hits per second over the current window.
    pub(crate) fn io_hits_per_second(&self) -> f64 {
        let elapsed = self.window_start.lock().elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.io_hit_count.load(Ordering::Relaxed) as f64 / elapsed
        }
    }

    /// Mean engine read latency per hit over the current window, in
    /// microseconds.
    pub(crate) fn io_time_per_hit_us(&self) -> f64 {
        let hits = self.io_hit_count.load(Ordering::Relaxed);
        if hits == 0 {
            0.0
        } else {
            self.io_hit_time_ns.load(Ordering::Relaxed) as f64 / hits as f64 / 1000.0
        }
    }

    /// Mean blocks evicted per free-space run.
    pub(crate) fn evicted_per_run(&self) -> f64 {
        let runs = self.eviction_runs();
        if runs == 0 {
            0.0
        } else {
            self.evicted_count() as f64 / runs as f64
        }
    }

    /// Close the IO window: zero the per-window counters and restart the
    /// clock. Cumulative hit/miss/eviction counters are untouched.
    pub(crate) fn reset_window(&self) {
        self.io_hit_count.store(0, Ordering::Relaxed);
        self.io_hit_time_ns.store(0, Ordering::Relaxed);
        *self.window_start.lock() = Instant::now();
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Point-in-time view of the cache's counters and sizes.
#[derive(Debug, Clone, Default)]
pub struct CacheStatsSnapshot {
    /// Admissions dropped because a writer queue stayed full.
    pub failed_block_additions: u64,
    /// Staged entries dropped because the allocator had no space.
    pub allocation_failures: u64,
    /// Total bytes managed by the allocator.
    pub total_size: u64,
    /// Bytes in free slots.
    pub free_size: u64,
    /// Bytes in occupied slots (whole-slot accounting).
    pub used_size: u64,
    /// Exact payload bytes persisted in the engine.
    pub cache_size: u64,
    /// Payload bytes currently staged in RAM.
    pub heap_size: u64,
    /// Blocks cached (staged plus persisted).
    pub block_count: u64,
    /// Total lookups.
    pub accesses: u64,
    /// Lookups that returned a payload.
    pub hits: u64,
    /// Lookups with the caching flag set.
    pub caching_accesses: u64,
    /// Hits with the caching flag set.
    pub caching_hits: u64,
    /// `hits / accesses`.
    pub hit_ratio: f64,
    /// `caching_hits / caching_accesses`.
    pub caching_hit_ratio: f64,
    /// Engine-served hits per second over the current window.
    pub io_hits_per_second: f64,
    /// Mean engine read latency per hit over the current window (us).
    pub io_time_per_hit_us: f64,
    /// Free-space runs.
    pub evictions: u64,
    /// Blocks evicted in total.
    pub evicted: u64,
    /// Blocks evicted that held SINGLE priority.
    pub evicted_single: u64,
    /// Blocks evicted that held MULTI priority.
    pub evicted_multi: u64,
    /// Blocks evicted that held MEMORY priority.
    pub evicted_memory: u64,
    /// Mean blocks evicted per free-space run.
    pub evicted_per_run: f64,
}

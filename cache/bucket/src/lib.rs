//! Secondary (L2) block cache over a size-classed bucket allocator.
//!
//! Stores opaque byte blocks keyed by `(file, offset)` in a large
//! fixed-capacity byte store (an [`IoEngine`]): process heap, an anonymous
//! mapping, or a file.
//!
//! # Architecture
//!
//! ```text
//!  cache_block()                    get_block()
//!       |                                |
//!       v                                v
//!  +-----------------+          +-----------------+
//!  | RAM staging     |--------->| backing map     |
//!  | (key->RamEntry) |  commit  | (key->BucketEntry)
//!  +--------+--------+          +--------+--------+
//!           | shard by hash              | offset lock
//!           v                            v
//!  +-----------------+          +-----------------+
//!  | writer queues   |          |    IoEngine     |
//!  | + worker threads|--------->| (heap/offheap/  |
//!  +-----------------+  write   |  file)          |
//!           |            sync   +-----------------+
//!           v
//!  +-----------------+
//!  | BucketAllocator |  size-classed slots, freed by the
//!  +-----------------+  three-priority eviction engine
//! ```
//!
//! Admissions are best-effort: a full queue, an exhausted size class, or an
//! engine failure drops the block and bumps a counter, never an error. The
//! backing map only ever references offsets whose writes were synced.
//! Sustained engine errors disable the cache entirely.
//!
//! # Example
//!
//! ```ignore
//! use bucket_cache::{BlockKey, BucketCache};
//!
//! let cache = BucketCache::builder()
//!     .capacity(256 * 1024 * 1024)
//!     .build()?;
//!
//! let key = BlockKey::new("store/f0001", 0);
//! cache.cache_block(key.clone(), payload);
//!
//! if let Some(bytes) = cache.get_block(&key, true, false) {
//!     // served from RAM staging or the byte store
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod allocator;
mod config;
mod entry;
mod error;
mod eviction;
mod index;
mod key;
mod offset_lock;
mod stats;
mod writer;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

pub use io_engine::{FileEngine, HeapEngine, IoEngine, OffheapEngine};

pub use crate::allocator::IndexStatistics;
pub use crate::config::{
    BucketCacheConfig, DEFAULT_BUCKET_SIZES, DEFAULT_BUFFER_SIZE, DEFAULT_ERROR_TOLERATION,
    DEFAULT_STATS_PERIOD, DEFAULT_WRITER_QUEUE_ITEMS, DEFAULT_WRITER_THREADS, EngineKind,
};
pub use crate::error::{AllocatorError, BuildError, ConfigError};
pub use crate::key::BlockKey;
pub use crate::stats::CacheStatsSnapshot;

use crate::allocator::BucketAllocator;
use crate::entry::{BucketEntry, RamEntry};
use crate::index::FileIndex;
use crate::offset_lock::OffsetLock;
use crate::stats::BucketCacheStats;
use crate::writer::{CACHE_WAIT_TIME, WriterQueue, spawn_writers};

/// Shared state behind the public handle; writers, the stats thread, and
/// eviction runs all hold an `Arc` of this.
pub(crate) struct CacheInner {
    pub(crate) engine: Box<dyn IoEngine>,
    pub(crate) allocator: BucketAllocator,
    /// Blocks staged in RAM until a worker persists them.
    pub(crate) ram_cache: DashMap<BlockKey, Arc<RamEntry>, ahash::RandomState>,
    /// Authoritative index of persisted blocks.
    pub(crate) backing_map: DashMap<BlockKey, Arc<BucketEntry>, ahash::RandomState>,
    pub(crate) index: FileIndex,
    pub(crate) offset_lock: OffsetLock,
    pub(crate) queues: Vec<WriterQueue>,
    /// Read on every public entry; writers observe it in their loops.
    pub(crate) enabled: AtomicBool,
    /// Guards a free-space run; a concurrent trigger returns immediately.
    pub(crate) free_space_lock: Mutex<()>,
    pub(crate) free_in_progress: AtomicBool,
    /// Process-wide access sequence: bumped on every admit and every hit.
    pub(crate) access_count: AtomicU64,
    /// Exact payload bytes persisted in the engine.
    pub(crate) real_cache_size: AtomicU64,
    /// Payload bytes currently staged in RAM.
    pub(crate) heap_size: AtomicU64,
    /// Blocks cached (staged plus persisted).
    pub(crate) block_number: AtomicU64,
    pub(crate) failed_block_additions: AtomicU64,
    pub(crate) allocation_failures: AtomicU64,
    /// Start of the current run of engine errors, cleared on any success.
    pub(crate) io_error_start: Mutex<Option<Instant>>,
    pub(crate) io_error_tolerance: Duration,
    pub(crate) stats: BucketCacheStats,
    /// Hasher for sharding keys across writer queues.
    pub(crate) hash_builder: ahash::RandomState,
}

impl CacheInner {
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn next_access_seq(&self) -> u64 {
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Note an engine failure; disable the cache once failures have lasted
    /// longer than the tolerance.
    pub(crate) fn report_io_error(&self) {
        let mut start = self.io_error_start.lock();
        match *start {
            None => *start = Some(Instant::now()),
            Some(since) => {
                if self.is_enabled() && since.elapsed() > self.io_error_tolerance {
                    drop(start);
                    tracing::error!(
                        tolerance_ms = self.io_error_tolerance.as_millis() as u64,
                        "io errors exceeded the tolerated duration, disabling bucket cache"
                    );
                    self.disable_cache();
                }
            }
        }
    }

    /// Note an engine success.
    pub(crate) fn clear_io_error(&self) {
        let mut start = self.io_error_start.lock();
        if start.is_some() {
            *start = None;
        }
    }

    /// Turn the cache off: used for shutdown and for riding out a broken
    /// engine. Idempotent.
    pub(crate) fn disable_cache(&self) {
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return;
        }
        self.engine.shutdown();
        for queue in &self.queues {
            queue.notify_all();
        }
        self.ram_cache.clear();
        self.backing_map.clear();
        self.stats.reset_window();
    }

    pub(crate) fn log_stats(&self) {
        let total = self.allocator.total_size();
        let used = self.allocator.used_size();
        tracing::debug!(
            failed_block_additions = self.failed_block_additions.load(Ordering::Relaxed),
            total,
            free = total - used,
            used_size = used,
            cache_size = self.real_cache_size.load(Ordering::Relaxed),
            accesses = self.stats.request_count(),
            hits = self.stats.hit_count(),
            io_hits_per_second = self.stats.io_hits_per_second(),
            io_time_per_hit_us = self.stats.io_time_per_hit_us(),
            hit_ratio = self.stats.hit_ratio(),
            caching_accesses = self.stats.request_caching_count(),
            caching_hits = self.stats.hit_caching_count(),
            caching_hits_ratio = self.stats.caching_hit_ratio(),
            evictions = self.stats.eviction_runs(),
            evicted = self.stats.evicted_count(),
            evicted_per_run = self.stats.evicted_per_run(),
            "bucket cache stats"
        );
        self.stats.reset_window();
    }
}

/// The L2 block cache.
///
/// Cheap to share behind an `Arc`; all operations take `&self`. Dropping
/// the handle shuts the cache down and joins its threads.
pub struct BucketCache {
    inner: Arc<CacheInner>,
    writer_handles: Mutex<Vec<JoinHandle<()>>>,
    stats_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BucketCache {
    /// Create a builder with default configuration.
    pub fn builder() -> BucketCacheBuilder {
        BucketCacheBuilder::new()
    }

    /// Admit a block. Best-effort, non-blocking, silently drops duplicates.
    pub fn cache_block(&self, key: BlockKey, data: impl Into<Bytes>) {
        self.cache_block_with_wait(key, data, false, false);
    }

    /// Admit a block with full control over pinning and backpressure.
    ///
    /// `in_memory` pins the block at MEMORY priority. With `wait` set, a
    /// full writer queue blocks the caller for up to 50 ms before the
    /// admission is abandoned.
    pub fn cache_block_with_wait(
        &self,
        key: BlockKey,
        data: impl Into<Bytes>,
        in_memory: bool,
        wait: bool,
    ) {
        let inner = &self.inner;
        if !inner.is_enabled() {
            return;
        }
        if inner.backing_map.contains_key(&key) || inner.ram_cache.contains_key(&key) {
            return;
        }

        let data = data.into();
        let len = data.len() as u64;
        let entry = Arc::new(RamEntry::new(
            key.clone(),
            data,
            inner.next_access_seq(),
            in_memory,
        ));
        inner.ram_cache.insert(key.clone(), entry.clone());

        let queue_idx = (inner.hash_builder.hash_one(&key) % inner.queues.len() as u64) as usize;
        let queue = &inner.queues[queue_idx];
        let mut enqueued = queue.try_enqueue(entry.clone());
        if !enqueued && wait {
            queue.wait_briefly(CACHE_WAIT_TIME);
            enqueued = queue.try_enqueue(entry);
        }

        if !enqueued {
            inner.ram_cache.remove(&key);
            inner.failed_block_additions.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.block_number.fetch_add(1, Ordering::Relaxed);
            inner.heap_size.fetch_add(len, Ordering::Relaxed);
            inner.index.insert(&key);
        }
    }

    /// Look up a block.
    ///
    /// `caching` marks lookups whose caller would cache on a miss (tracked
    /// separately in the stats). With `repeat` set, a miss is not recorded
    /// - for follow-up probes of a key that already missed.
    pub fn get_block(&self, key: &BlockKey, caching: bool, repeat: bool) -> Option<Bytes> {
        let inner = &self.inner;
        if !inner.is_enabled() {
            return None;
        }

        if let Some(staged) = inner.ram_cache.get(key).map(|e| e.value().clone()) {
            inner.stats.hit(caching);
            staged.access(inner.next_access_seq());
            return Some(staged.data().clone());
        }

        if let Some(entry) = inner.backing_map.get(key).map(|e| e.value().clone()) {
            let start = Instant::now();
            let lock = inner.offset_lock.lock(entry.offset());
            // Re-check under the lock: an evictor may have removed and
            // freed this range between the lookup and the acquisition.
            let current = inner.backing_map.get(key).map(|e| e.value().clone());
            if let Some(current) = current
                && Arc::ptr_eq(&current, &entry)
            {
                let mut buf = vec![0u8; entry.length() as usize];
                match inner.engine.read(&mut buf, entry.offset()) {
                    Ok(()) => {
                        inner.stats.hit(caching);
                        inner.stats.io_hit(start.elapsed());
                        entry.access(inner.next_access_seq());
                        inner.clear_io_error();
                        drop(lock);
                        return Some(Bytes::from(buf));
                    }
                    Err(e) => {
                        tracing::error!(key = %key, error = %e, "failed reading block from bucket cache");
                        drop(lock);
                        inner.report_io_error();
                    }
                }
            }
        }

        if !repeat {
            inner.stats.miss(caching);
        }
        None
    }

    /// Remove a block, staged or persisted. Returns whether a persisted
    /// block was removed.
    pub fn evict_block(&self, key: &BlockKey) -> bool {
        self.inner.evict_block(key)
    }

    /// Evict every cached block of one data file.
    ///
    /// Linear in the file's cached block count; blocks admitted while the
    /// scan runs are not guaranteed to be evicted. Returns the number of
    /// persisted blocks removed.
    pub fn evict_blocks_by_file(&self, file: &str) -> usize {
        let keys = self.inner.index.keys_for_file(file);
        keys.iter().filter(|key| self.inner.evict_block(key)).count()
    }

    /// Evict everything.
    pub fn clear(&self) {
        let persisted: Vec<BlockKey> = self
            .inner
            .backing_map
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for key in persisted {
            self.inner.evict_block(&key);
        }
        let staged: Vec<BlockKey> = self
            .inner
            .ram_cache
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for key in staged {
            self.inner.evict_block(&key);
        }
    }

    /// Disable the cache and join its threads. Idempotent.
    pub fn shutdown(&self) {
        self.inner.disable_cache();
        let handles = std::mem::take(&mut *self.writer_handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        if let Some(handle) = self.stats_handle.lock().take() {
            let _ = handle.join();
        }
        tracing::info!("shut down bucket cache");
    }

    /// Exact payload bytes persisted in the engine.
    pub fn size(&self) -> u64 {
        self.inner.real_cache_size.load(Ordering::Relaxed)
    }

    /// Bytes available in unoccupied allocator slots.
    pub fn free_size(&self) -> u64 {
        self.inner.allocator.free_size()
    }

    /// Bytes consumed by occupied allocator slots (whole-slot accounting).
    pub fn used_size(&self) -> u64 {
        self.inner.allocator.used_size()
    }

    /// Blocks cached, staged plus persisted.
    pub fn block_count(&self) -> u64 {
        self.inner.block_number.load(Ordering::Relaxed)
    }

    /// Payload bytes currently staged in RAM.
    pub fn heap_size(&self) -> u64 {
        self.inner.heap_size.load(Ordering::Relaxed)
    }

    /// Number of blocks staged in RAM.
    pub fn ram_block_count(&self) -> usize {
        self.inner.ram_cache.len()
    }

    /// Number of blocks persisted in the engine.
    pub fn persisted_block_count(&self) -> usize {
        self.inner.backing_map.len()
    }

    /// Whether the cache is accepting operations.
    pub fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    /// How long the current run of engine errors has lasted, if one is
    /// active.
    pub fn io_error_duration(&self) -> Option<Duration> {
        (*self.inner.io_error_start.lock()).map(|since| since.elapsed())
    }

    /// Snapshot of counters and sizes.
    pub fn stats(&self) -> CacheStatsSnapshot {
        let inner = &self.inner;
        let stats = &inner.stats;
        let (evicted_single, evicted_multi, evicted_memory) = stats.evicted_by_priority();
        CacheStatsSnapshot {
            failed_block_additions: inner.failed_block_additions.load(Ordering::Relaxed),
            allocation_failures: inner.allocation_failures.load(Ordering::Relaxed),
            total_size: inner.allocator.total_size(),
            free_size: inner.allocator.free_size(),
            used_size: inner.allocator.used_size(),
            cache_size: inner.real_cache_size.load(Ordering::Relaxed),
            heap_size: inner.heap_size.load(Ordering::Relaxed),
            block_count: inner.block_number.load(Ordering::Relaxed),
            accesses: stats.request_count(),
            hits: stats.hit_count(),
            caching_accesses: stats.request_caching_count(),
            caching_hits: stats.hit_caching_count(),
            hit_ratio: stats.hit_ratio(),
            caching_hit_ratio: stats.caching_hit_ratio(),
            io_hits_per_second: stats.io_hits_per_second(),
            io_time_per_hit_us: stats.io_time_per_hit_us(),
            evictions: stats.eviction_runs(),
            evicted: stats.evicted_count(),
            evicted_single,
            evicted_multi,
            evicted_memory,
            evicted_per_run: stats.evicted_per_run(),
        }
    }

    /// Per-size-class occupancy statistics.
    pub fn size_class_statistics(&self) -> Vec<IndexStatistics> {
        self.inner.allocator.index_statistics()
    }
}

impl Drop for BucketCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_stats_thread(inner: &Arc<CacheInner>, period: Duration) -> JoinHandle<()> {
    let inner = inner.clone();
    thread::Builder::new()
        .name("bucket-cache-stats".to_string())
        .spawn(move || {
            let step = Duration::from_millis(200).min(period);
            let mut elapsed = Duration::ZERO;
            while inner.is_enabled() {
                thread::sleep(step);
                elapsed += step;
                if elapsed >= period {
                    inner.log_stats();
                    elapsed = Duration::ZERO;
                }
            }
        })
        .expect("failed to spawn stats thread")
}

/// Builder for [`BucketCache`].
#[derive(Default)]
pub struct BucketCacheBuilder {
    config: BucketCacheConfig,
    engine_override: Option<Box<dyn IoEngine>>,
}

impl BucketCacheBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: BucketCacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Select the byte store kind (see also [`EngineKind`]'s `FromStr`
    /// for `"heap"` / `"offheap"` / `"file:<path>"` names).
    pub fn engine(mut self, kind: EngineKind) -> Self {
        self.config.engine = kind;
        self
    }

    /// Use a caller-supplied engine instead of building one. Its reported
    /// capacity becomes the cache capacity.
    pub fn custom_engine(mut self, engine: Box<dyn IoEngine>) -> Self {
        self.engine_override = Some(engine);
        self
    }

    /// Total capacity in bytes. At most 32 TiB.
    pub fn capacity(mut self, bytes: u64) -> Self {
        self.config.capacity = bytes;
        self
    }

    /// Number of writer threads (and queues).
    pub fn writer_threads(mut self, count: usize) -> Self {
        self.config.writer_threads = count;
        self
    }

    /// Capacity of each writer queue, in entries.
    pub fn queue_capacity(mut self, entries: usize) -> Self {
        self.config.queue_capacity = entries;
        self
    }

    /// Duration of sustained I/O errors tolerated before disabling.
    pub fn io_error_tolerance(mut self, tolerance: Duration) -> Self {
        self.config.io_error_tolerance = tolerance;
        self
    }

    /// Period between stats log lines.
    pub fn stats_period(mut self, period: Duration) -> Self {
        self.config.stats_period = period;
        self
    }

    /// Slot size classes: strictly increasing, each a multiple of 256.
    pub fn bucket_sizes(mut self, sizes: Vec<u32>) -> Self {
        self.config.bucket_sizes = sizes;
        self
    }

    /// Requested per-buffer size for the heap engine.
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.config.buffer_size = bytes;
        self
    }

    /// Build the cache and start its writer and stats threads.
    pub fn build(self) -> Result<BucketCache, BuildError> {
        let config = self.config;
        config.validate()?;

        // A caller-supplied engine dictates the capacity; otherwise the
        // configured capacity does. The allocator validates it either way
        // before any engine memory is committed.
        let capacity = match &self.engine_override {
            Some(engine) => engine.capacity(),
            None => config.capacity,
        };
        config::validate_capacity(capacity)?;
        let allocator = BucketAllocator::new(&config.bucket_sizes, capacity)?;

        let engine: Box<dyn IoEngine> = match self.engine_override {
            Some(engine) => engine,
            None => {
                let buffer_size = config.effective_buffer_size();
                if buffer_size != config.buffer_size {
                    tracing::warn!(
                        requested = config.buffer_size,
                        actual = buffer_size,
                        "adjusted per-buffer size to cover the smallest size class"
                    );
                }
                match &config.engine {
                    EngineKind::Heap => Box::new(HeapEngine::new(config.capacity, buffer_size)),
                    EngineKind::Offheap => Box::new(OffheapEngine::new(config.capacity)?),
                    EngineKind::File(path) => Box::new(FileEngine::open(path, config.capacity)?),
                }
            }
        };
        let queues = (0..config.writer_threads)
            .map(|_| WriterQueue::new(config.queue_capacity))
            .collect();

        let inner = Arc::new(CacheInner {
            engine,
            allocator,
            ram_cache: DashMap::with_hasher(ahash::RandomState::new()),
            backing_map: DashMap::with_hasher(ahash::RandomState::new()),
            index: FileIndex::new(),
            offset_lock: OffsetLock::new(),
            queues,
            enabled: AtomicBool::new(true),
            free_space_lock: Mutex::new(()),
            free_in_progress: AtomicBool::new(false),
            access_count: AtomicU64::new(0),
            real_cache_size: AtomicU64::new(0),
            heap_size: AtomicU64::new(0),
            block_number: AtomicU64::new(0),
            failed_block_additions: AtomicU64::new(0),
            allocation_failures: AtomicU64::new(0),
            io_error_start: Mutex::new(None),
            io_error_tolerance: config.io_error_tolerance,
            stats: BucketCacheStats::new(),
            hash_builder: ahash::RandomState::new(),
        });

        let writer_handles = spawn_writers(&inner);
        let stats_handle = spawn_stats_thread(&inner, config.stats_period);
        tracing::info!(
            capacity,
            writer_threads = config.writer_threads,
            "started bucket cache"
        );

        Ok(BucketCache {
            inner,
            writer_handles: Mutex::new(writer_handles),
            stats_handle: Mutex::new(Some(stats_handle)),
        })
    }
}

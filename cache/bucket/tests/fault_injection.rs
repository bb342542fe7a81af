//! Engine-failure tests: write failures, sync failures, sustained-error
//! disablement, and the reader-versus-evictor race, driven through wrapper
//! engines around a real heap engine.

use bucket_cache::{BlockKey, BucketCache, HeapEngine, IoEngine};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Failure switches shared between a test and its engine.
#[derive(Default)]
struct Faults {
    fail_next_write: AtomicBool,
    fail_sync: AtomicBool,
}

/// Heap engine with injectable write and sync failures.
struct FaultEngine {
    inner: HeapEngine,
    faults: Arc<Faults>,
}

impl FaultEngine {
    fn boxed(capacity: u64, faults: Arc<Faults>) -> Box<dyn IoEngine> {
        Box::new(Self {
            inner: HeapEngine::new(capacity, 1024 * 1024),
            faults,
        })
    }
}

impl IoEngine for FaultEngine {
    fn capacity(&self) -> u64 {
        self.inner.capacity()
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.inner.read(buf, offset)
    }

    fn write(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        if self.faults.fail_next_write.swap(false, Ordering::AcqRel) {
            return Err(io::Error::other("injected write failure"));
        }
        self.inner.write(buf, offset)
    }

    fn sync(&self) -> io::Result<()> {
        if self.faults.fail_sync.load(Ordering::Acquire) {
            return Err(io::Error::other("injected sync failure"));
        }
        self.inner.sync()
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }
}

/// Gate a reader can be parked on mid-`read`, so a concurrent evictor can
/// be observed waiting on the offset lock.
#[derive(Default)]
struct ReadGate {
    /// 0 = disarmed, 1 = armed, 2 = a reader is parked, 3 = released.
    state: Mutex<u8>,
    cv: Condvar,
}

impl ReadGate {
    fn arm(&self) {
        *self.state.lock().unwrap() = 1;
    }

    fn park_if_armed(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == 1 {
            *state = 2;
            self.cv.notify_all();
            while *state == 2 {
                state = self.cv.wait(state).unwrap();
            }
        }
    }

    fn wait_for_parked_reader(&self) {
        let mut state = self.state.lock().unwrap();
        while *state != 2 {
            state = self.cv.wait(state).unwrap();
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        *state = 3;
        self.cv.notify_all();
    }
}

struct GatedEngine {
    inner: HeapEngine,
    gate: Arc<ReadGate>,
}

impl IoEngine for GatedEngine {
    fn capacity(&self) -> u64 {
        self.inner.capacity()
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.gate.park_if_armed();
        self.inner.read(buf, offset)
    }

    fn write(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.inner.write(buf, offset)
    }

    fn sync(&self) -> io::Result<()> {
        self.inner.sync()
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }
}

fn settle(cache: &BucketCache) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let observe = |cache: &BucketCache| {
        let stats = cache.stats();
        (stats.heap_size, stats.block_count, stats.used_size, stats.cache_size)
    };
    let mut last = observe(cache);
    let mut stable_since = Instant::now();
    while Instant::now() < deadline {
        thread::sleep(Duration::from_millis(25));
        let now = observe(cache);
        if now != last {
            last = now;
            stable_since = Instant::now();
        } else if stable_since.elapsed() >= Duration::from_millis(400) {
            return;
        }
    }
}

fn fault_cache(faults: &Arc<Faults>) -> BucketCache {
    BucketCache::builder()
        .custom_engine(FaultEngine::boxed(4 * 1024 * 1024, faults.clone()))
        .bucket_sizes(vec![4096, 8192, 16384])
        .writer_threads(1)
        .build()
        .unwrap()
}

#[test]
fn test_write_failure_drops_block_without_leaking_a_slot() {
    let faults = Arc::new(Faults::default());
    let cache = fault_cache(&faults);

    faults.fail_next_write.store(true, Ordering::Release);
    let key = BlockKey::new("f", 0);
    cache.cache_block_with_wait(key.clone(), vec![5u8; 4096], false, true);
    settle(&cache);

    // No commit happened and the allocated slot went back to the free
    // list; the failure is a writer-side drop, not a failed addition.
    assert_eq!(cache.persisted_block_count(), 0);
    assert_eq!(cache.used_size(), 0);
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.stats().failed_block_additions, 0);
    assert!(cache.io_error_duration().is_some());
    assert!(cache.is_enabled());
}

#[test]
fn test_sync_failure_rolls_back_the_whole_batch() {
    let faults = Arc::new(Faults::default());
    let cache = fault_cache(&faults);

    faults.fail_sync.store(true, Ordering::Release);
    let keys: Vec<BlockKey> = (0..10).map(|i| BlockKey::new("f", i * 4096)).collect();
    for key in &keys {
        cache.cache_block_with_wait(key.clone(), vec![6u8; 4096], false, true);
    }
    settle(&cache);

    // None of the keys were committed and every allocation was freed.
    assert_eq!(cache.persisted_block_count(), 0);
    assert_eq!(cache.used_size(), 0);
    assert_eq!(cache.size(), 0);
    assert!(cache.io_error_duration().is_some());

    // The blocks are still staged; a healthy engine lets them retire on a
    // later admission path, but nothing references unsynced offsets.
    assert_eq!(cache.ram_block_count(), 10);
    assert_eq!(cache.block_count(), 10);
}

#[test]
fn test_sustained_errors_disable_the_cache() {
    let faults = Arc::new(Faults::default());
    let cache = BucketCache::builder()
        .custom_engine(FaultEngine::boxed(4 * 1024 * 1024, faults.clone()))
        .bucket_sizes(vec![4096])
        .writer_threads(1)
        .io_error_tolerance(Duration::ZERO)
        .build()
        .unwrap();

    faults.fail_sync.store(true, Ordering::Release);

    // Each failed batch reports one error; the second report exceeds the
    // zero tolerance and disables the cache.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut i = 0u64;
    while cache.is_enabled() && Instant::now() < deadline {
        cache.cache_block_with_wait(BlockKey::new("f", i * 4096), vec![7u8; 4096], false, true);
        i += 1;
        thread::sleep(Duration::from_millis(20));
    }

    assert!(!cache.is_enabled(), "cache should have disabled itself");
    // No sync ever succeeded, so nothing was committed; the disabled cache
    // answers nothing.
    assert_eq!(cache.persisted_block_count(), 0);
    assert!(cache.get_block(&BlockKey::new("f", 0), false, false).is_none());
    assert_eq!(cache.stats().accesses, 0);
}

#[test]
fn test_evict_waits_for_inflight_read() {
    let gate = Arc::new(ReadGate::default());
    let cache = Arc::new(
        BucketCache::builder()
            .custom_engine(Box::new(GatedEngine {
                inner: HeapEngine::new(4 * 1024 * 1024, 1024 * 1024),
                gate: gate.clone(),
            }))
            .bucket_sizes(vec![4096])
            .writer_threads(1)
            .build()
            .unwrap(),
    );

    let key = BlockKey::new("f", 0);
    let payload = vec![8u8; 4096];
    cache.cache_block_with_wait(key.clone(), payload.clone(), false, true);
    settle(&cache);
    assert_eq!(cache.persisted_block_count(), 1);

    // Park the next read mid-engine-call, holding the offset lock.
    gate.arm();
    let reader = {
        let cache = cache.clone();
        let key = key.clone();
        thread::spawn(move || cache.get_block(&key, false, false))
    };
    gate.wait_for_parked_reader();

    let evictor = {
        let cache = cache.clone();
        let key = key.clone();
        thread::spawn(move || cache.evict_block(&key))
    };

    // The evictor must block on the offset lock while the read is
    // in flight.
    thread::sleep(Duration::from_millis(150));
    assert!(!evictor.is_finished(), "evict overtook an in-flight read");

    gate.release();
    let read = reader.join().unwrap();
    assert_eq!(read.expect("read completes with the old bytes"), payload);
    assert!(evictor.join().unwrap(), "evict succeeds after the read");
    assert_eq!(cache.persisted_block_count(), 0);
    assert_eq!(cache.used_size(), 0);
}

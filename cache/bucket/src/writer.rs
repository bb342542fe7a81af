//! Writer queues and the worker threads that drain them.
//!
//! Admissions land in one of N bounded queues, sharded by key hash. Each
//! queue is owned by one worker thread which drains it in batches:
//! allocate + write each entry, `sync` the engine once per batch, and only
//! then commit the batch into the backing map. The sync-before-commit order
//! is the durability discipline of the whole cache: the backing map never
//! references an offset whose write has not been synced.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};

use crate::CacheInner;
use crate::entry::RamEntry;
use crate::error::{AllocatorError, StoreError};

/// How long a blocked admission waits for a queue slot before giving up.
pub(crate) const CACHE_WAIT_TIME: Duration = Duration::from_millis(50);

/// Poll interval at which a blocked worker re-checks the enable flag.
const TAKE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a worker sleeps when allocation fails while another thread is
/// already freeing space.
const FREE_IN_PROGRESS_SLEEP: Duration = Duration::from_millis(50);

/// One bounded admission queue plus the signal blocked admitters park on.
pub(crate) struct WriterQueue {
    tx: Sender<Arc<RamEntry>>,
    rx: Receiver<Arc<RamEntry>>,
    wait_lock: Mutex<()>,
    wait_signal: Condvar,
}

impl WriterQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            wait_lock: Mutex::new(()),
            wait_signal: Condvar::new(),
        }
    }

    /// Non-blocking enqueue.
    pub(crate) fn try_enqueue(&self, entry: Arc<RamEntry>) -> bool {
        !matches!(self.tx.try_send(entry), Err(TrySendError::Full(_)))
    }

    /// Park until the owning worker drains the queue, bounded by `timeout`.
    pub(crate) fn wait_briefly(&self, timeout: Duration) {
        let mut guard = self.wait_lock.lock();
        self.wait_signal.wait_for(&mut guard, timeout);
    }

    /// Wake every admission parked on this queue.
    pub(crate) fn notify_all(&self) {
        let _guard = self.wait_lock.lock();
        self.wait_signal.notify_all();
    }
}

/// Spawn one worker per queue.
pub(crate) fn spawn_writers(inner: &Arc<CacheInner>) -> Vec<JoinHandle<()>> {
    (0..inner.queues.len())
        .map(|idx| {
            let inner = inner.clone();
            thread::Builder::new()
                .name(format!("bucket-cache-writer-{idx}"))
                .spawn(move || writer_loop(inner, idx))
                .expect("failed to spawn writer thread")
        })
        .collect()
}

fn writer_loop(inner: Arc<CacheInner>, idx: usize) {
    let queue = &inner.queues[idx];
    let rx = queue.rx.clone();
    let mut batch: Vec<Arc<RamEntry>> = Vec::new();

    while inner.is_enabled() {
        // Blocking take first, so an empty queue parks instead of spinning.
        match rx.recv_timeout(TAKE_POLL_INTERVAL) {
            Ok(entry) => batch.push(entry),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
        while let Ok(entry) = rx.try_recv() {
            batch.push(entry);
        }
        queue.notify_all();
        inner.do_drain(&mut batch);
    }

    tracing::info!(
        worker = idx,
        enabled = inner.is_enabled(),
        "bucket cache writer exiting"
    );
}

impl CacheInner {
    /// Persist a batch of staged entries and commit the survivors.
    ///
    /// Entries are processed newest-first. A failed entry is dropped from
    /// the batch but stays in the staging table, where a later admission or
    /// eviction removes it.
    pub(crate) fn do_drain(&self, entries: &mut Vec<Arc<RamEntry>>) {
        let mut ram_entries = Vec::with_capacity(entries.len());
        let mut bucket_entries = Vec::with_capacity(entries.len());

        while self.is_enabled() {
            let Some(entry) = entries.pop() else { break };
            match entry.write_to_cache(self.engine.as_ref(), &self.allocator, &self.real_cache_size)
            {
                Ok(bucket_entry) => {
                    self.clear_io_error();
                    ram_entries.push(entry);
                    bucket_entries.push(Arc::new(bucket_entry));
                }
                Err(StoreError::Allocator(AllocatorError::CacheFull { size })) => {
                    tracing::warn!(
                        key = %entry.key(),
                        size,
                        "block does not fit any size class, dropping"
                    );
                    self.allocation_failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(StoreError::Allocator(AllocatorError::NoSpaceInSizeClass { .. })) => {
                    self.allocation_failures.fetch_add(1, Ordering::Relaxed);
                    if !self.free_in_progress.load(Ordering::Acquire) {
                        self.free_space();
                    } else {
                        thread::sleep(FREE_IN_PROGRESS_SLEEP);
                    }
                }
                Err(StoreError::Io(e)) => {
                    tracing::error!(key = %entry.key(), error = %e, "failed writing block to bucket cache");
                    self.report_io_error();
                }
            }
        }

        // The data pages we wrote must be on the media before the map
        // references them.
        if let Err(e) = self.engine.sync() {
            tracing::error!(error = %e, "failed syncing io engine");
            self.report_io_error();
            for bucket_entry in bucket_entries.drain(..) {
                self.allocator.free(bucket_entry.offset());
                self.real_cache_size
                    .fetch_sub(u64::from(bucket_entry.length()), Ordering::Relaxed);
            }
            ram_entries.clear();
        }

        for (ram_entry, bucket_entry) in ram_entries.drain(..).zip(bucket_entries.drain(..)) {
            self.backing_map
                .insert(ram_entry.key().clone(), bucket_entry);
            if let Some((_, staged)) = self.ram_cache.remove(ram_entry.key()) {
                self.heap_size
                    .fetch_sub(staged.data().len() as u64, Ordering::Relaxed);
            }
        }

        if self.allocator.used_size() > self.acceptable_size() {
            self.free_space();
        }
    }
}

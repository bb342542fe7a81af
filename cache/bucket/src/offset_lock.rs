//! Sparse per-offset mutual exclusion.
//!
//! Serializes a read of a persisted block against a concurrent free of the
//! same byte range. Lock entries are created on demand and removed when the
//! last holder releases, so the table only ever holds offsets under active
//! contention.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

/// One refcounted lock slot. The refcount is only touched while the table
/// lock is held.
struct LockSlot {
    mutex: Arc<Mutex<()>>,
    refs: usize,
}

/// Mapping from live offset to a refcounted mutex.
#[derive(Default)]
pub(crate) struct OffsetLock {
    table: Mutex<HashMap<u64, LockSlot>>,
}

impl OffsetLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Block until the lock for `offset` is held.
    pub(crate) fn lock(&self, offset: u64) -> OffsetGuard<'_> {
        let mutex = {
            let mut table = self.table.lock();
            let slot = table.entry(offset).or_insert_with(|| LockSlot {
                mutex: Arc::new(Mutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            slot.mutex.clone()
        };
        let guard = mutex.lock_arc();
        OffsetGuard {
            owner: self,
            offset,
            guard: Some(guard),
        }
    }

    /// Number of offsets with live lock entries.
    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.table.lock().len()
    }
}

/// Holds the lock for one offset; releasing drops the table entry when no
/// other holder or waiter remains.
pub(crate) struct OffsetGuard<'a> {
    owner: &'a OffsetLock,
    offset: u64,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl Drop for OffsetGuard<'_> {
    fn drop(&mut self) {
        // Release the offset mutex before touching the table so a waiter
        // can proceed without holding the table lock.
        self.guard.take();
        let mut table = self.owner.table.lock();
        if let Some(slot) = table.get_mut(&self.offset) {
            slot.refs -= 1;
            if slot.refs == 0 {
                table.remove(&self.offset);
            }
        }
    }
}

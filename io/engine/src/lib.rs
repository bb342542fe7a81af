//! Byte-addressable store engines for the bucket cache.
//!
//! This crate provides the [`IoEngine`] trait that abstracts over the byte
//! store backing a cache:
//!
//! - **[`HeapEngine`]**: process-heap storage split into fixed-size buffers.
//! - **[`OffheapEngine`]**: a single anonymous memory mapping.
//! - **[`FileEngine`]**: a preallocated file accessed with positional I/O.
//!
//! # Design
//!
//! An engine is a flat byte region addressed by absolute offset. The caller
//! owns the layout of that region (which ranges are live, which are free);
//! the engine only moves bytes and orders them with `sync`. None of the
//! engines promise that data survives a process restart - a cache built on
//! top must treat the region as empty at construction.
//!
//! # Concurrency
//!
//! All operations take `&self`. Engines do not serialize access to
//! overlapping ranges; callers must ensure that a range being read is not
//! concurrently rewritten (the bucket cache does this with its per-offset
//! lock and allocator discipline).

#![warn(missing_docs)]
#![warn(clippy::all)]

mod file;
mod heap;
mod offheap;

use std::io;

pub use file::FileEngine;
pub use heap::HeapEngine;
pub use offheap::OffheapEngine;

/// A byte-addressable store.
pub trait IoEngine: Send + Sync {
    /// Total addressable capacity in bytes.
    fn capacity(&self) -> u64;

    /// Fill `buf` with bytes starting at `offset`.
    ///
    /// Fails with `InvalidInput` if the range falls outside the capacity.
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Write all of `buf` starting at `offset`.
    ///
    /// Fails with `InvalidInput` if the range falls outside the capacity.
    fn write(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Make all writes visible before this call durable/ordered before
    /// subsequent reads return them.
    fn sync(&self) -> io::Result<()>;

    /// Release resources. Idempotent; operations after shutdown are
    /// undefined in content but must not be unsound.
    fn shutdown(&self);
}

/// Validate that `offset..offset + len` lies within `capacity`.
pub(crate) fn check_range(capacity: u64, offset: u64, len: usize) -> io::Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
    if end > capacity {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("range {offset}..{end} exceeds engine capacity {capacity}"),
        ));
    }
    Ok(())
}

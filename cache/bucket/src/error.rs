//! Error types for cache construction and allocation.

/// Errors returned by the bucket allocator.
///
/// Neither variant escapes the public API: the write pipeline translates
/// both into dropped admissions and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    /// The size class covering this length has no free slot and no
    /// completely-free bucket could be converted. Recoverable: an eviction
    /// pass frees slots.
    #[error("no free slots in the size class covering a {size} byte block")]
    NoSpaceInSizeClass {
        /// Requested allocation length in bytes.
        size: usize,
    },

    /// The length exceeds the largest configured size class, so no amount
    /// of eviction can ever satisfy it. Fatal for the admission.
    #[error("a {size} byte block does not fit any configured size class")]
    CacheFull {
        /// Requested allocation length in bytes.
        size: usize,
    },
}

/// Construction-time configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Capacity exceeds what the entry encoding supports (32 TiB).
    #[error("cache capacity {0} is too large, only up to 32TiB is supported")]
    CapacityTooLarge(u64),

    /// Capacity does not cover even a single bucket.
    #[error("cache capacity {capacity} is smaller than one bucket ({bucket_capacity} bytes)")]
    CapacityTooSmall {
        /// Configured capacity in bytes.
        capacity: u64,
        /// Derived bucket capacity in bytes.
        bucket_capacity: u64,
    },

    /// The size class vector is empty.
    #[error("size class list must not be empty")]
    EmptySizeClasses,

    /// The size class vector is not strictly increasing and positive.
    #[error("size classes must be positive and strictly increasing")]
    UnsortedSizeClasses,

    /// A size class would produce slot offsets that break the 256-byte
    /// alignment the entry encoding requires.
    #[error("size class {0} is not a multiple of 256")]
    UnalignedSizeClass(u32),

    /// No writer threads configured.
    #[error("writer thread count must be at least 1")]
    NoWriterThreads,

    /// Writer queues cannot hold a single entry.
    #[error("writer queue capacity must be at least 1")]
    ZeroQueueCapacity,

    /// Unrecognized engine name.
    #[error("unknown io engine {0:?}, expected \"heap\", \"offheap\", or \"file:<path>\"")]
    UnknownEngine(String),
}

/// Errors surfaced by [`crate::BucketCacheBuilder::build`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The io engine could not be created.
    #[error("failed creating io engine: {0}")]
    Engine(#[from] std::io::Error),
}

/// Failure of a single staged entry on its way into the byte store.
#[derive(Debug, thiserror::Error)]
pub(crate) enum StoreError {
    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

//! Configuration for the bucket cache.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::entry::OFFSET_ALIGNMENT;
use crate::error::ConfigError;

/// Default number of writer threads.
pub const DEFAULT_WRITER_THREADS: usize = 3;

/// Default capacity of each writer queue, in entries.
pub const DEFAULT_WRITER_QUEUE_ITEMS: usize = 64;

/// Default duration of sustained I/O errors tolerated before the cache
/// disables itself.
pub const DEFAULT_ERROR_TOLERATION: Duration = Duration::from_secs(60);

/// Default period between stats log lines.
pub const DEFAULT_STATS_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Default requested per-buffer size for the heap engine (4 MiB). The
/// effective size is never smaller than the smallest size class.
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Default size classes: 4KB..512KB block sizes, each with 1KB of headroom
/// for block metadata. All are multiples of 256 so every slot offset stays
/// encodable.
pub const DEFAULT_BUCKET_SIZES: &[u32] = &[
    5 * 1024,
    9 * 1024,
    17 * 1024,
    33 * 1024,
    41 * 1024,
    49 * 1024,
    57 * 1024,
    65 * 1024,
    97 * 1024,
    129 * 1024,
    193 * 1024,
    257 * 1024,
    385 * 1024,
    513 * 1024,
];

/// Granularity used for the capacity ceiling check: the entry index is
/// sized as `capacity / 16384`, and that quotient must fit an `i32`, which
/// bounds the capacity at 32 TiB.
const CAPACITY_CHECK_BLOCK: u64 = 16384;

/// Which byte store backs the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineKind {
    /// Process-heap buffers.
    Heap,
    /// Anonymous memory mapping outside the allocator-managed heap.
    Offheap,
    /// A preallocated file at the given path.
    File(PathBuf),
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "heap" {
            Ok(EngineKind::Heap)
        } else if s == "offheap" {
            Ok(EngineKind::Offheap)
        } else if let Some(path) = s.strip_prefix("file:") {
            Ok(EngineKind::File(PathBuf::from(path)))
        } else {
            Err(ConfigError::UnknownEngine(s.to_string()))
        }
    }
}

/// Tunables for [`crate::BucketCache`].
///
/// Usually assembled through [`crate::BucketCacheBuilder`].
#[derive(Debug, Clone)]
pub struct BucketCacheConfig {
    /// Byte store kind.
    pub engine: EngineKind,
    /// Total engine capacity in bytes. At most 32 TiB.
    pub capacity: u64,
    /// Number of writer threads (and writer queues).
    pub writer_threads: usize,
    /// Capacity of each writer queue, in entries.
    pub queue_capacity: usize,
    /// Duration of sustained I/O errors tolerated before the cache
    /// disables itself.
    pub io_error_tolerance: Duration,
    /// Period between stats log lines.
    pub stats_period: Duration,
    /// Slot size classes, strictly increasing, each a multiple of 256.
    pub bucket_sizes: Vec<u32>,
    /// Requested per-buffer size for the heap engine.
    pub buffer_size: usize,
}

impl Default for BucketCacheConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Heap,
            capacity: 1024 * 1024 * 1024,
            writer_threads: DEFAULT_WRITER_THREADS,
            queue_capacity: DEFAULT_WRITER_QUEUE_ITEMS,
            io_error_tolerance: DEFAULT_ERROR_TOLERATION,
            stats_period: DEFAULT_STATS_PERIOD,
            bucket_sizes: DEFAULT_BUCKET_SIZES.to_vec(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl BucketCacheConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_capacity(self.capacity)?;
        validate_bucket_sizes(&self.bucket_sizes)?;
        if self.writer_threads == 0 {
            return Err(ConfigError::NoWriterThreads);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }

    /// Per-buffer size actually used by the heap engine: never smaller
    /// than the smallest size class.
    pub fn effective_buffer_size(&self) -> usize {
        let min = self.bucket_sizes.first().copied().unwrap_or(0) as usize;
        self.buffer_size.max(min)
    }
}

/// Reject capacities the entry index cannot address.
pub(crate) fn validate_capacity(capacity: u64) -> Result<(), ConfigError> {
    if capacity / CAPACITY_CHECK_BLOCK >= i32::MAX as u64 {
        return Err(ConfigError::CapacityTooLarge(capacity));
    }
    Ok(())
}

fn validate_bucket_sizes(sizes: &[u32]) -> Result<(), ConfigError> {
    if sizes.is_empty() {
        return Err(ConfigError::EmptySizeClasses);
    }
    let mut prev = 0u32;
    for &size in sizes {
        if size == 0 || size <= prev {
            return Err(ConfigError::UnsortedSizeClasses);
        }
        if u64::from(size) % OFFSET_ALIGNMENT != 0 {
            return Err(ConfigError::UnalignedSizeClass(size));
        }
        prev = size;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        BucketCacheConfig::default().validate().unwrap();
    }

    #[test]
    fn test_default_bucket_sizes_aligned_and_sorted() {
        validate_bucket_sizes(DEFAULT_BUCKET_SIZES).unwrap();
    }

    #[test]
    fn test_capacity_ceiling() {
        // 32 TiB is the first rejected capacity.
        let limit = CAPACITY_CHECK_BLOCK * i32::MAX as u64;
        assert!(validate_capacity(limit - 1).is_ok());
        assert!(matches!(
            validate_capacity(limit + CAPACITY_CHECK_BLOCK),
            Err(ConfigError::CapacityTooLarge(_))
        ));
    }

    #[test]
    fn test_bucket_size_validation() {
        assert!(matches!(
            validate_bucket_sizes(&[]),
            Err(ConfigError::EmptySizeClasses)
        ));
        assert!(matches!(
            validate_bucket_sizes(&[8192, 4096]),
            Err(ConfigError::UnsortedSizeClasses)
        ));
        assert!(matches!(
            validate_bucket_sizes(&[4096, 4096]),
            Err(ConfigError::UnsortedSizeClasses)
        ));
        assert!(matches!(
            validate_bucket_sizes(&[4096, 5000]),
            Err(ConfigError::UnalignedSizeClass(5000))
        ));
        assert!(validate_bucket_sizes(&[4096, 8192, 16384]).is_ok());
    }

    #[test]
    fn test_engine_kind_parsing() {
        assert_eq!("heap".parse::<EngineKind>().unwrap(), EngineKind::Heap);
        assert_eq!("offheap".parse::<EngineKind>().unwrap(), EngineKind::Offheap);
        assert_eq!(
            "file:/tmp/cache.dat".parse::<EngineKind>().unwrap(),
            EngineKind::File(PathBuf::from("/tmp/cache.dat"))
        );
        assert!("mmap".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_effective_buffer_size() {
        let mut config = BucketCacheConfig {
            buffer_size: 1024,
            bucket_sizes: vec![4096, 8192],
            ..Default::default()
        };
        assert_eq!(config.effective_buffer_size(), 4096);

        config.buffer_size = 64 * 1024;
        assert_eq!(config.effective_buffer_size(), 64 * 1024);
    }
}

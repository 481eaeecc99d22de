//! Abstract settings for the engine.

use serde::{Deserialize, Serialize};

/// Tuning knobs for an engine instance.
///
/// These parameters apply to every farm opened by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct Settings {
    /// Heap size in bytes beyond which a persistent heap switches from
    /// process memory to a file-backed mapping.
    ///
    /// Defaults to 1 MiB.
    pub mmap_threshold: usize,
    /// Lower bound on the number of hash buckets built for a BAT.
    ///
    /// Defaults to 1024.
    pub hash_bucket_floor: usize,
    /// Average collision-chain length beyond which the hash index doubles its
    /// bucket count.
    ///
    /// Defaults to 4.
    pub hash_grow_threshold: usize,
    /// Interval, in milliseconds, at which the background trimmer scans for
    /// cold unreferenced BATs to unload.
    ///
    /// Defaults to 10 seconds. Zero disables the trimmer.
    pub trim_interval_ms: u64,
    /// Whether commits fsync heaps and directory files before declaring
    /// success.
    ///
    /// Defaults to `true`. The `nosync` debug category overrides this at
    /// run time.
    pub sync_on_commit: bool,
}

impl Settings {
    /// Creates a new `Settings` object.
    pub fn new(
        mmap_threshold: usize,
        hash_bucket_floor: usize,
        hash_grow_threshold: usize,
        trim_interval_ms: u64,
        sync_on_commit: bool,
    ) -> Self {
        Self {
            mmap_threshold,
            hash_bucket_floor,
            hash_grow_threshold,
            trim_interval_ms,
            sync_on_commit,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(1 << 20, 1024, 4, 10_000, true)
    }
}

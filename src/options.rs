use serde::{Deserialize, Serialize};

/// Tuning knobs for opening caches.
///
/// `coords_bucket_size` is baked into a coordinate cache when it is first
/// created. Reopening it with a different value is refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Number of coordinate slots per bucket file.
    pub coords_bucket_size: u64,
    /// How many bucket files are kept mapped at the same time.
    pub open_buckets: usize,
    /// Whether `close` fsyncs data before returning.
    pub sync_on_close: bool,
}

impl CacheOptions {
    pub const DEFAULT_BUCKET_SIZE: u64 = 1 << 20;
    pub const DEFAULT_OPEN_BUCKETS: usize = 64;

    pub fn with_bucket_size(mut self, coords_bucket_size: u64) -> Self {
        self.coords_bucket_size = coords_bucket_size;
        self
    }

    pub fn with_open_buckets(mut self, open_buckets: usize) -> Self {
        self.open_buckets = open_buckets;
        self
    }

    pub fn with_sync_on_close(mut self, sync_on_close: bool) -> Self {
        self.sync_on_close = sync_on_close;
        self
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            coords_bucket_size: Self::DEFAULT_BUCKET_SIZE,
            open_buckets: Self::DEFAULT_OPEN_BUCKETS,
            sync_on_close: true,
        }
    }
}

//! Cache sizing configuration.

/// Per-segment file capacities. Files are created sparse at full
/// capacity and the segment rolls when the log or an index fills up.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Log file capacity before the segment rolls (default: 64 MiB)
    pub segment_bytes: u32,

    /// Offset index capacity (default: 2 MiB, one 8-byte row per entry)
    pub segment_index_bytes: u32,

    /// Hash index capacity (default: 4 MiB, one row per key and one per
    /// header)
    pub segment_hash_bytes: u32,

    /// Delta file capacity (default: 16 MiB)
    pub segment_delta_bytes: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            segment_bytes: 64 * 1024 * 1024,
            segment_index_bytes: 2 * 1024 * 1024,
            segment_hash_bytes: 4 * 1024 * 1024,
            segment_delta_bytes: 16 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Small file sizes for tests that exercise segment rolling.
    pub fn small() -> Self {
        Self {
            segment_bytes: 1024,
            segment_index_bytes: 256,
            segment_hash_bytes: 512,
            segment_delta_bytes: 1024,
        }
    }
}

//! Gateway Configuration
//!
//! Process-wide settings for the fetch path:
//!
//! - **fetch_max_bytes**: upper bound for a single merged fetch response
//!   (default: 50 MiB)
//! - **fetch_partition_max_bytes**: upper bound for one partition's share
//!   of a response (default: 1 MiB)
//! - **topic_bootstrap_enabled**: create unknown topics on first describe
//!   (default: true)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Maximum bytes in flight for a merged fetch response (default: 50 MiB)
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: usize,

    /// Maximum bytes in flight per partition fetch (default: 1 MiB)
    #[serde(default = "default_fetch_partition_max_bytes")]
    pub fetch_partition_max_bytes: usize,

    /// Auto-create topics on first describe (default: true)
    #[serde(default = "default_topic_bootstrap_enabled")]
    pub topic_bootstrap_enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            fetch_max_bytes: default_fetch_max_bytes(),
            fetch_partition_max_bytes: default_fetch_partition_max_bytes(),
            topic_bootstrap_enabled: default_topic_bootstrap_enabled(),
        }
    }
}

fn default_fetch_max_bytes() -> usize {
    50 * 1024 * 1024 // 50 MiB
}

fn default_fetch_partition_max_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_topic_bootstrap_enabled() -> bool {
    true
}

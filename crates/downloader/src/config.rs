use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine tunables. Every field defaults to the production constant; tests
/// narrow the QoS bounds to keep deadlines short.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Trusted height below which peers are rejected as unsynced and above
    /// which fast-sync ancient writes are enabled.
    pub checkpoint: u64,
    /// In-flight block cache budget, in items.
    pub block_cache_items: usize,
    /// Lower clamp for the smoothed round-trip estimate, in milliseconds.
    pub rtt_min_ms: u64,
    /// Upper clamp for the smoothed round-trip estimate, in milliseconds.
    pub rtt_max_ms: u64,
    /// Hard cap on the derived request deadline, in milliseconds.
    pub ttl_limit_ms: u64,
    /// Recheck interval while header fetching waits on the pivot commit,
    /// in milliseconds.
    pub header_cont_check_ms: u64,
}

fn default_block_cache_items() -> usize {
    8192
}

fn default_rtt_min_ms() -> u64 {
    2_000
}

fn default_rtt_max_ms() -> u64 {
    20_000
}

fn default_ttl_limit_ms() -> u64 {
    60_000
}

fn default_header_cont_check_ms() -> u64 {
    3_000
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            checkpoint: 0,
            block_cache_items: default_block_cache_items(),
            rtt_min_ms: default_rtt_min_ms(),
            rtt_max_ms: default_rtt_max_ms(),
            ttl_limit_ms: default_ttl_limit_ms(),
            header_cont_check_ms: default_header_cont_check_ms(),
        }
    }
}

impl DownloaderConfig {
    pub fn rtt_min(&self) -> Duration {
        Duration::from_millis(self.rtt_min_ms)
    }

    pub fn rtt_max(&self) -> Duration {
        Duration::from_millis(self.rtt_max_ms)
    }

    pub fn ttl_limit(&self) -> Duration {
        Duration::from_millis(self.ttl_limit_ms)
    }

    pub fn header_cont_check(&self) -> Duration {
        Duration::from_millis(self.header_cont_check_ms)
    }
}

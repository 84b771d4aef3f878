//! Configuration types for drivemirror

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the metadata mirror.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Wall-clock cadence of the change poller (milliseconds)
    pub poll_interval_ms: u64,
    /// Entries in the in-memory file view cache
    pub lru_capacity: usize,
    /// Freshness window for cached download urls (seconds)
    pub download_url_lifetime_secs: u64,
    /// Lowest inode handed to real files; everything below is reserved for
    /// synthetic entries
    pub inode_floor: u64,
    /// Page size requested from the change source
    pub max_results: u32,
    /// Depth of the poller-to-applier handoff channel
    pub change_queue_depth: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 60_000,
            lru_capacity: 1000,
            download_url_lifetime_secs: 12 * 60 * 60,
            inode_floor: 1000,
            max_results: 1000,
            change_queue_depth: 200,
        }
    }
}

impl MirrorConfig {
    /// Poll cadence as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Download url freshness window as a `Duration`.
    pub fn download_url_lifetime(&self) -> Duration {
        Duration::from_secs(self.download_url_lifetime_secs)
    }
}

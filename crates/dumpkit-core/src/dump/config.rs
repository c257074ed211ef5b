use std::time::Duration;

use crate::scan::LatencyBands;
use crate::verification::HashAlgorithm;

/// Dump engine configuration
#[derive(Debug, Clone)]
pub struct DumpConfig {
    /// Blocks requested per read in the linear pass
    pub blocks_per_read: u32,
    /// Single-block passes over the bad-block list after the linear pass
    pub retry_passes: u32,
    /// Persist the resume document after this many blocks
    pub flush_every_blocks: u64,
    /// ...or after this much time, whichever comes first
    pub flush_interval: Duration,
    /// End the linear pass at the first failed read
    pub stop_on_error: bool,
    /// Digests computed over the finished image
    pub hash_algorithms: Vec<HashAlgorithm>,
    pub latency_bands: Option<LatencyBands>,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            blocks_per_read: 64,
            retry_passes: 1,
            flush_every_blocks: 16 * 1024,
            flush_interval: Duration::from_secs(30),
            stop_on_error: false,
            hash_algorithms: vec![HashAlgorithm::MD5, HashAlgorithm::SHA256],
            latency_bands: Some(LatencyBands::default()),
        }
    }
}

/// Read-only surface scan of a block source
use std::time::Instant;

use crate::device::BlockSource;
use crate::dumplog::{failed_read_duration, DumpLogWriter};

use super::accumulator::{LatencyBands, ScanAccumulator, ScanResults};

/// Media scan configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub blocks_per_read: u32,
    /// Number of seeks in the seek test, spread evenly over the media
    pub seek_samples: u32,
    pub latency_bands: Option<LatencyBands>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            blocks_per_read: 64,
            seek_samples: 1000,
            latency_bands: Some(LatencyBands::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub current_block: u64,
    pub total_blocks: u64,
    pub errored: u64,
    pub current_speed: f64,
}

pub struct MediaScanner<S: BlockSource> {
    source: S,
    config: ScanConfig,
    progress_callback: Option<Box<dyn Fn(ScanProgress) + Send + Sync>>,
}

impl<S: BlockSource> MediaScanner<S> {
    pub fn new(source: S, config: ScanConfig) -> Self {
        Self {
            source,
            config,
            progress_callback: None,
        }
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(ScanProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Scan the whole device, then run the seek test.
    ///
    /// Read failures are recorded in the results. A failing log is dropped
    /// and the scan continues.
    pub fn scan(&mut self, mut log: Option<&mut DumpLogWriter>) -> ScanResults {
        let info = self.source.info().clone();
        let blocks_per_read = self.config.blocks_per_read.max(1);
        let mut acc =
            ScanAccumulator::new(info.block_size).with_bands(self.config.latency_bands);

        tracing::info!(
            "Scanning {} blocks of {} bytes on {} {}",
            info.block_count,
            info.block_size,
            info.manufacturer,
            info.model
        );

        let mut lba = 0u64;
        while lba < info.block_count {
            let count = (info.block_count - lba).min(blocks_per_read as u64) as u32;

            let started = Instant::now();
            let result = self.source.read_blocks(lba, count);
            let duration = started.elapsed();

            let success = match result {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!("Error reading {} blocks at {}: {}", count, lba, e);
                    false
                }
            };
            acc.record_read(lba, count, duration, success);

            if let Some(log) = log.as_deref_mut() {
                let logged = if success {
                    duration
                } else {
                    failed_read_duration(duration)
                };
                if let Err(e) = log.write(lba, logged) {
                    tracing::warn!("Continuing scan without MHDD log: {}", e);
                }
            }

            if let Some(ref callback) = self.progress_callback {
                callback(ScanProgress {
                    current_block: lba + count as u64,
                    total_blocks: info.block_count,
                    errored: acc.errored(),
                    current_speed: acc.avg_speed(),
                });
            }

            lba += count as u64;
        }

        self.seek_test(&mut acc, info.block_count);

        let results = acc.finish();
        tracing::info!(
            "Scan complete: {} blocks, {} unreadable, {:.2} MiB/s average",
            results.blocks,
            results.errored,
            results.avg_speed
        );
        results
    }

    fn seek_test(&mut self, acc: &mut ScanAccumulator, block_count: u64) {
        let samples = self.config.seek_samples as u64;
        if samples == 0 {
            return;
        }

        for i in 0..samples {
            let target = (i as u128 * block_count as u128 / samples as u128) as u64;
            let started = Instant::now();
            match self.source.seek(target) {
                Ok(()) => acc.record_seek(started.elapsed()),
                Err(e) => tracing::debug!("Seek to {} failed: {}", target, e),
            }
        }
    }
}

/// Running statistics over per-read timing samples
///
/// One [`ScanAccumulator`] lives for the duration of a scan or dump pass. It
/// is fed every read (and, separately, every seek measurement) and turned
/// into an immutable [`ScanResults`] when the pass ends.
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const BYTES_PER_MIB: f64 = 1_048_576.0;

/// Number of free-form counters carried by [`ScanResults`]
pub const COUNTER_SLOTS: usize = 6;

/// Latency thresholds splitting successful reads over the six counters.
///
/// A read lands in the first slot whose threshold it is below; anything at or
/// above the last threshold goes to the sixth slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyBands {
    pub thresholds: [Duration; COUNTER_SLOTS - 1],
}

impl Default for LatencyBands {
    fn default() -> Self {
        Self {
            thresholds: [
                Duration::from_millis(3),
                Duration::from_millis(10),
                Duration::from_millis(50),
                Duration::from_millis(150),
                Duration::from_millis(500),
            ],
        }
    }
}

impl LatencyBands {
    pub fn slot(&self, duration: Duration) -> usize {
        self.thresholds
            .iter()
            .position(|&limit| duration < limit)
            .unwrap_or(COUNTER_SLOTS - 1)
    }
}

/// Final statistics of a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResults {
    pub total_time: Duration,
    /// Time spent inside reads
    pub processing_time: Duration,
    /// MiB/s over all timed successful reads
    pub avg_speed: f64,
    pub max_speed: f64,
    pub min_speed: f64,
    pub counters: [u64; COUNTER_SLOTS],
    pub unreadable_sectors: Vec<u64>,
    pub seek_max: Option<Duration>,
    pub seek_min: Option<Duration>,
    pub seek_total: Duration,
    pub seek_times: u64,
    pub blocks: u64,
    pub errored: u64,
}

impl ScanResults {
    pub fn avg_seek(&self) -> Option<Duration> {
        if self.seek_times == 0 {
            return None;
        }
        Some(self.seek_total / self.seek_times as u32)
    }
}

pub struct ScanAccumulator {
    block_size: u32,
    bands: Option<LatencyBands>,
    started: Instant,
    processing_time: Duration,
    timed_bytes: u64,
    timed_duration: Duration,
    max_speed: Option<f64>,
    min_speed: Option<f64>,
    counters: [u64; COUNTER_SLOTS],
    unreadable: Vec<u64>,
    seek_max: Option<Duration>,
    seek_min: Option<Duration>,
    seek_total: Duration,
    seek_times: u64,
    blocks: u64,
    errored: u64,
}

impl ScanAccumulator {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            bands: Some(LatencyBands::default()),
            started: Instant::now(),
            processing_time: Duration::ZERO,
            timed_bytes: 0,
            timed_duration: Duration::ZERO,
            max_speed: None,
            min_speed: None,
            counters: [0; COUNTER_SLOTS],
            unreadable: Vec::new(),
            seek_max: None,
            seek_min: None,
            seek_total: Duration::ZERO,
            seek_times: 0,
            blocks: 0,
            errored: 0,
        }
    }

    /// Use custom latency bands, or `None` to leave the counters to the caller
    pub fn with_bands(mut self, bands: Option<LatencyBands>) -> Self {
        self.bands = bands;
        self
    }

    /// Record one read of `sectors` blocks starting at `address`
    pub fn record_read(&mut self, address: u64, sectors: u32, duration: Duration, success: bool) {
        self.blocks += sectors as u64;
        self.processing_time += duration;

        if !success {
            self.errored += sectors as u64;
            self.unreadable
                .extend((0..sectors as u64).map(|offset| address + offset));
            return;
        }

        if let Some(bands) = &self.bands {
            self.counters[bands.slot(duration)] += 1;
        }

        // A zero-length sample carries no throughput information
        if duration.is_zero() {
            return;
        }

        let bytes = sectors as u64 * self.block_size as u64;
        let speed = bytes as f64 / BYTES_PER_MIB / duration.as_secs_f64();
        self.max_speed = Some(self.max_speed.map_or(speed, |max| max.max(speed)));
        self.min_speed = Some(self.min_speed.map_or(speed, |min| min.min(speed)));
        self.timed_bytes += bytes;
        self.timed_duration += duration;
    }

    pub fn record_seek(&mut self, duration: Duration) {
        self.seek_max = Some(self.seek_max.map_or(duration, |max| max.max(duration)));
        self.seek_min = Some(self.seek_min.map_or(duration, |min| min.min(duration)));
        self.seek_total += duration;
        self.seek_times += 1;
    }

    /// Increment a free-form counter. Out-of-range slots are ignored.
    pub fn bump_counter(&mut self, slot: usize) {
        if let Some(counter) = self.counters.get_mut(slot) {
            *counter += 1;
        }
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn errored(&self) -> u64 {
        self.errored
    }

    /// Cumulative throughput so far in MiB/s
    pub fn avg_speed(&self) -> f64 {
        if self.timed_duration.is_zero() {
            return 0.0;
        }
        self.timed_bytes as f64 / BYTES_PER_MIB / self.timed_duration.as_secs_f64()
    }

    pub fn finish(self) -> ScanResults {
        ScanResults {
            total_time: self.started.elapsed(),
            processing_time: self.processing_time,
            avg_speed: self.avg_speed(),
            max_speed: self.max_speed.unwrap_or(0.0),
            min_speed: self.min_speed.unwrap_or(0.0),
            counters: self.counters,
            unreadable_sectors: self.unreadable,
            seek_max: self.seek_max,
            seek_min: self.seek_min,
            seek_total: self.seek_total,
            seek_times: self.seek_times,
            blocks: self.blocks,
            errored: self.errored,
        }
    }
}

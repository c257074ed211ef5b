/// Resumable sector-by-sector acquisition
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::device::{BlockSource, DeviceInfo};
use crate::dumplog::{failed_read_duration, DumpLogWriter};
use crate::resume::{ResumeReconciler, ResumeSession, ResumeStore};
use crate::scan::{ScanAccumulator, ScanResults};
use crate::verification::{hash_image, ImageHash};

use super::config::DumpConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DumpStage {
    Reading,
    Retrying { pass: u32 },
    Hashing,
    Complete,
}

#[derive(Debug, Clone)]
pub struct DumpProgress {
    pub stage: DumpStage,
    pub current_block: u64,
    pub total_blocks: u64,
    pub captured_blocks: u64,
    pub bad_blocks: usize,
}

/// Outcome of one dump run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpReport {
    pub output: PathBuf,
    pub resume_file: Option<PathBuf>,
    /// An earlier attempt was continued
    pub resumed: bool,
    pub attempt: usize,
    pub total_blocks: u64,
    /// Blocks held by the current attempt, including earlier runs
    pub captured_blocks: u64,
    /// Blocks read successfully during this run
    pub blocks_read: u64,
    pub bad_blocks: Vec<u64>,
    pub stopped_on_error: bool,
    pub scan: ScanResults,
    pub hashes: Vec<ImageHash>,
}

impl DumpReport {
    pub fn is_complete(&self) -> bool {
        self.captured_blocks == self.total_blocks
    }
}

/// Persists the resume document on a block-count or wall-clock cadence
struct FlushSchedule {
    every_blocks: u64,
    interval: Duration,
    pending: u64,
    last: Instant,
}

impl FlushSchedule {
    fn new(config: &DumpConfig) -> Self {
        Self {
            every_blocks: config.flush_every_blocks.max(1),
            interval: config.flush_interval,
            pending: 0,
            last: Instant::now(),
        }
    }

    fn due(&mut self, blocks: u64) -> bool {
        self.pending += blocks;
        self.pending >= self.every_blocks || self.last.elapsed() >= self.interval
    }

    fn reset(&mut self) {
        self.pending = 0;
        self.last = Instant::now();
    }
}

pub struct Dumper<S: BlockSource> {
    source: S,
    config: DumpConfig,
    reconciler: ResumeReconciler,
    progress_callback: Option<Box<dyn Fn(DumpProgress) + Send + Sync>>,
}

impl<S: BlockSource> Dumper<S> {
    pub fn new(source: S, config: DumpConfig) -> Self {
        Self {
            source,
            config,
            reconciler: ResumeReconciler::default(),
            progress_callback: None,
        }
    }

    /// Use a specific software identity when matching resume attempts
    pub fn with_reconciler(mut self, reconciler: ResumeReconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(DumpProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn emit_progress(&self, stage: DumpStage, current_block: u64, session: &ResumeSession) {
        if let Some(ref callback) = self.progress_callback {
            callback(DumpProgress {
                stage,
                current_block,
                total_blocks: session.state().block_count(),
                captured_blocks: session.extents().covered(),
                bad_blocks: session.bad_blocks().len(),
            });
        }
    }

    /// Dump the source into `output`.
    ///
    /// With a `store`, an existing resume document is reconciled first and the
    /// document is kept current while reading. Reconciliation failures
    /// ([`crate::resume::ResumeError`]) abort before any sector is read.
    pub fn run(
        &mut self,
        output: &Path,
        store: Option<&ResumeStore>,
        mut log: Option<&mut DumpLogWriter>,
    ) -> Result<DumpReport> {
        let info = self.source.info().clone();

        let existing = match store {
            Some(store) => store.load()?,
            None => None,
        };
        let mut session = self.reconciler.process(&info.probe(), existing)?;

        if let Some(store) = store {
            store.save(session.snapshot())?;
        }

        // Without a resume document the image starts empty
        let mut image = open_image(output, &info, store.is_none())?;
        let mut acc = ScanAccumulator::new(info.block_size).with_bands(self.config.latency_bands);

        tracing::info!(
            "Dumping {} {} ({} blocks) to {}, starting at block {}",
            info.manufacturer,
            info.model,
            info.block_count,
            output.display(),
            session.next_block()
        );

        let mut blocks_read = 0u64;
        let stopped_on_error = self.linear_pass(
            &info,
            &mut session,
            &mut image,
            &mut acc,
            &mut log,
            store,
            &mut blocks_read,
        )?;

        if !stopped_on_error {
            for pass in 1..=self.config.retry_passes {
                if session.bad_blocks().is_empty() {
                    break;
                }
                blocks_read += self.retry_pass(pass, &info, &mut session, &mut image)?;
                if let Some(store) = store {
                    store.save(session.snapshot())?;
                }
            }
        }

        image.flush()?;
        image.sync_all().context("Failed to sync output image")?;
        drop(image);

        if let Some(store) = store {
            store.save(session.snapshot())?;
        }

        let hashes = if stopped_on_error || self.config.hash_algorithms.is_empty() {
            Vec::new()
        } else {
            self.emit_progress(DumpStage::Hashing, info.block_count, &session);
            hash_image(output, &self.config.hash_algorithms)
                .context(format!("Failed to hash {}", output.display()))?
        };

        self.emit_progress(DumpStage::Complete, info.block_count, &session);

        let report = DumpReport {
            output: output.to_path_buf(),
            resume_file: store.map(|s| s.path().to_path_buf()),
            resumed: session.is_resumed(),
            attempt: session.attempt_index(),
            total_blocks: info.block_count,
            captured_blocks: session.extents().covered(),
            blocks_read,
            bad_blocks: session.bad_blocks().iter().copied().collect(),
            stopped_on_error,
            scan: acc.finish(),
            hashes,
        };

        tracing::info!(
            "Dump finished: {}/{} blocks captured, {} bad blocks",
            report.captured_blocks,
            report.total_blocks,
            report.bad_blocks.len()
        );

        Ok(report)
    }

    /// Read every block not yet captured. Returns whether the pass stopped on
    /// an error.
    #[allow(clippy::too_many_arguments)]
    fn linear_pass(
        &mut self,
        info: &DeviceInfo,
        session: &mut ResumeSession,
        image: &mut File,
        acc: &mut ScanAccumulator,
        log: &mut Option<&mut DumpLogWriter>,
        store: Option<&ResumeStore>,
        blocks_read: &mut u64,
    ) -> Result<bool> {
        let blocks_per_read = self.config.blocks_per_read.max(1) as u64;
        let mut flush = FlushSchedule::new(&self.config);
        let mut lba = session.next_block();

        while lba < info.block_count {
            lba = match session.extents().next_uncovered(lba) {
                Some(next) if next < info.block_count => next,
                _ => break,
            };

            // Stop short of the next captured run
            let limit = session
                .extents()
                .next_extent_start(lba)
                .unwrap_or(info.block_count)
                .min(info.block_count);
            let count = (limit - lba).min(blocks_per_read) as u32;

            let started = Instant::now();
            let result = self.source.read_blocks(lba, count);
            let duration = started.elapsed();

            let expected_len = count as usize * info.block_size as usize;
            let data = match result {
                Ok(data) if data.len() == expected_len => Some(data),
                Ok(data) => {
                    tracing::warn!(
                        "Short read at block {}: {} of {} bytes",
                        lba,
                        data.len(),
                        expected_len
                    );
                    None
                }
                Err(e) => {
                    tracing::warn!("Error reading {} blocks at {}: {}", count, lba, e);
                    None
                }
            };

            let success = data.is_some();
            if let Some(data) = data {
                write_blocks(image, info, lba, &data)?;
                session.record_success_run(lba, count as u64);
                *blocks_read += count as u64;
            } else {
                for block in lba..lba + count as u64 {
                    session.record_failure(block);
                }
            }

            acc.record_read(lba, count, duration, success);
            if let Some(log) = log.as_deref_mut() {
                let logged = if success {
                    duration
                } else {
                    failed_read_duration(duration)
                };
                // The writer disables itself on failure; the dump carries on
                if let Err(e) = log.write(lba, logged) {
                    tracing::warn!("Continuing dump without MHDD log: {}", e);
                }
            }

            lba += count as u64;
            session.advance_to(lba);

            if flush.due(count as u64) {
                if let Some(store) = store {
                    store.save(session.snapshot())?;
                }
                flush.reset();
            }

            self.emit_progress(DumpStage::Reading, lba, session);

            if !success && self.config.stop_on_error {
                tracing::warn!("Stopping at block {} on read error", lba);
                return Ok(true);
            }
        }

        session.advance_to(info.block_count);
        Ok(false)
    }

    /// Re-read each bad block on its own. Returns how many were recovered.
    fn retry_pass(
        &mut self,
        pass: u32,
        info: &DeviceInfo,
        session: &mut ResumeSession,
        image: &mut File,
    ) -> Result<u64> {
        let pending: Vec<u64> = session
            .bad_blocks()
            .iter()
            .copied()
            .filter(|&block| block < info.block_count)
            .collect();

        tracing::info!("Retry pass {}: {} bad blocks", pass, pending.len());

        let mut recovered = 0u64;
        for block in pending {
            match self.source.read_blocks(block, 1) {
                Ok(data) if data.len() == info.block_size as usize => {
                    write_blocks(image, info, block, &data)?;
                    session.record_success(block);
                    recovered += 1;
                    tracing::debug!("Recovered block {} on pass {}", block, pass);
                }
                Ok(_) => tracing::debug!("Short read of block {} on pass {}", block, pass),
                Err(e) => tracing::debug!("Block {} still unreadable: {}", block, e),
            }
            self.emit_progress(DumpStage::Retrying { pass }, block, session);
        }

        Ok(recovered)
    }
}

fn open_image(output: &Path, info: &DeviceInfo, truncate: bool) -> Result<File> {
    let image = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(truncate)
        .open(output)
        .context(format!("Failed to open output image {}", output.display()))?;

    let capacity = info.capacity();
    if image.metadata()?.len() < capacity {
        image
            .set_len(capacity)
            .context("Failed to size output image")?;
    }
    Ok(image)
}

fn write_blocks(image: &mut File, info: &DeviceInfo, lba: u64, data: &[u8]) -> Result<()> {
    image.seek(SeekFrom::Start(lba * info.block_size as u64))?;
    image
        .write_all(data)
        .context(format!("Failed to write block {} to output image", lba))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;
    use crate::extents::Extent;
    use std::collections::HashSet;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Blocks hold their own index; listed blocks fail a set number of times
    struct ScratchedDisk {
        info: DeviceInfo,
        bad: HashSet<u64>,
        failures_left: u32,
        reads: Arc<Mutex<Vec<(u64, u32)>>>,
    }

    impl ScratchedDisk {
        fn new(blocks: u64, bad: &[u64], failures: u32) -> Self {
            Self {
                info: DeviceInfo {
                    kind: DeviceKind::Ata,
                    manufacturer: "ACME".to_string(),
                    model: "Model1".to_string(),
                    serial: "SN123".to_string(),
                    firmware: "1.0".to_string(),
                    block_size: 16,
                    block_count: blocks,
                    removable: false,
                    is_lba: true,
                },
                bad: bad.iter().copied().collect(),
                failures_left: failures,
                reads: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl BlockSource for ScratchedDisk {
        fn info(&self) -> &DeviceInfo {
            &self.info
        }

        fn read_blocks(&mut self, lba: u64, count: u32) -> io::Result<Vec<u8>> {
            self.reads.lock().unwrap().push((lba, count));
            let hits_bad = (lba..lba + count as u64).any(|b| self.bad.contains(&b));
            if hits_bad && self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(io::Error::new(io::ErrorKind::Other, "unrecovered read error"));
            }
            let mut data = Vec::new();
            for block in lba..lba + count as u64 {
                data.extend(std::iter::repeat(block as u8).take(self.info.block_size as usize));
            }
            Ok(data)
        }
    }

    fn quiet_config() -> DumpConfig {
        DumpConfig {
            blocks_per_read: 4,
            retry_passes: 0,
            hash_algorithms: Vec::new(),
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_dump_copies_every_block() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("disk.img");

        let mut dumper = Dumper::new(ScratchedDisk::new(10, &[], 0), quiet_config());
        let report = dumper.run(&output, None, None).unwrap();

        assert!(report.is_complete());
        assert_eq!(report.blocks_read, 10);
        assert!(report.bad_blocks.is_empty());
        assert_eq!(report.scan.blocks, 10);

        let data = std::fs::read(&output).unwrap();
        assert_eq!(data.len(), 160);
        assert_eq!(data[9 * 16], 9);
    }

    #[test]
    fn test_fresh_dump_discards_stale_output() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("disk.img");
        std::fs::write(&output, vec![0xEE; 400]).unwrap();

        let mut dumper = Dumper::new(ScratchedDisk::new(10, &[5], u32::MAX), quiet_config());
        let report = dumper.run(&output, None, None).unwrap();
        assert_eq!(report.bad_blocks, vec![4, 5, 6, 7]);

        let data = std::fs::read(&output).unwrap();
        assert_eq!(data.len(), 160);
        assert!(data[4 * 16..8 * 16].iter().all(|&b| b == 0));
        assert_eq!(data[8 * 16], 8);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_log_failure_does_not_stop_dump() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("disk.img");

        let source = ScratchedDisk::new(2000, &[], 0);
        let header = crate::dumplog::DumpLogHeader::from_device(&source.info, 1);
        let mut log = DumpLogWriter::create("/dev/full", &header).unwrap();

        let config = DumpConfig {
            blocks_per_read: 1,
            ..quiet_config()
        };
        let mut dumper = Dumper::new(source, config);
        let report = dumper.run(&output, None, Some(&mut log)).unwrap();

        assert!(report.is_complete());
        assert_eq!(report.blocks_read, 2000);
        assert!(log.is_closed());
    }

    #[test]
    fn test_failed_reads_become_bad_blocks() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("disk.img");

        let mut dumper = Dumper::new(ScratchedDisk::new(12, &[5], u32::MAX), quiet_config());
        let report = dumper.run(&output, None, None).unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.bad_blocks, vec![4, 5, 6, 7]);
        assert_eq!(report.captured_blocks, 8);
        assert_eq!(report.scan.errored, 4);
        assert!(!report.stopped_on_error);
    }

    #[test]
    fn test_retry_pass_recovers_blocks() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("disk.img");

        let config = DumpConfig {
            retry_passes: 2,
            ..quiet_config()
        };
        // Fails the linear read and the first single-block retry of block 5
        let mut dumper = Dumper::new(ScratchedDisk::new(12, &[5], 2), config);
        let report = dumper.run(&output, None, None).unwrap();

        assert!(report.is_complete());
        assert!(report.bad_blocks.is_empty());
        assert_eq!(report.blocks_read, 12);
        let data = std::fs::read(&output).unwrap();
        assert_eq!(data[5 * 16], 5);
    }

    #[test]
    fn test_stop_on_error() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("disk.img");

        let config = DumpConfig {
            stop_on_error: true,
            retry_passes: 3,
            ..quiet_config()
        };
        let mut dumper = Dumper::new(ScratchedDisk::new(12, &[5], u32::MAX), config);
        let report = dumper.run(&output, None, None).unwrap();

        assert!(report.stopped_on_error);
        assert_eq!(report.captured_blocks, 4);
        assert_eq!(report.bad_blocks, vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_resume_skips_captured_blocks() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("disk.img");
        let store = ResumeStore::for_image(&output);

        // Pretend a previous run captured blocks 0-5 and stopped
        let reconciler = ResumeReconciler::default();
        let disk = ScratchedDisk::new(10, &[], 0);
        let mut session = reconciler.process(&disk.info.probe(), None).unwrap();
        session.record_success_run(0, 6);
        session.advance_to(6);
        store.save(session.snapshot()).unwrap();

        let reads = disk.reads.clone();
        let mut dumper = Dumper::new(disk, quiet_config());
        let report = dumper.run(&output, Some(&store), None).unwrap();

        assert!(report.resumed);
        assert!(report.is_complete());
        assert_eq!(report.blocks_read, 4);
        assert_eq!(*reads.lock().unwrap(), vec![(6, 4)]);

        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.tries.len(), 1);
        assert_eq!(saved.tries[0].extents, vec![Extent::new(0, 9)]);
        assert_eq!(saved.next_block, 10);
    }

    #[test]
    fn test_reconcile_failure_reads_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("disk.img");
        let store = ResumeStore::for_image(&output);

        let other = ScratchedDisk::new(20, &[], 0);
        let session = ResumeReconciler::default()
            .process(&other.info.probe(), None)
            .unwrap();
        let (state, _, _) = session.into_parts();
        store.save(&state).unwrap();

        let disk = ScratchedDisk::new(10, &[], 0);
        let reads = disk.reads.clone();
        let mut dumper = Dumper::new(disk, quiet_config());
        let err = dumper.run(&output, Some(&store), None).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<crate::resume::ResumeError>(),
            Some(crate::resume::ResumeError::CapacityMismatch { expected: 20, found: 10 })
        ));
        assert!(reads.lock().unwrap().is_empty());
        assert!(!output.exists());
        // The stored document is untouched
        assert_eq!(store.load().unwrap().unwrap(), state);
    }

    #[test]
    fn test_progress_and_hashes() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("disk.img");

        let config = DumpConfig {
            hash_algorithms: vec![crate::verification::HashAlgorithm::MD5],
            ..quiet_config()
        };
        let stages = Arc::new(Mutex::new(Vec::new()));
        let seen = stages.clone();

        let mut dumper = Dumper::new(ScratchedDisk::new(8, &[], 0), config);
        dumper.set_progress_callback(move |progress| seen.lock().unwrap().push(progress.stage));
        let report = dumper.run(&output, None, None).unwrap();

        assert_eq!(report.hashes.len(), 1);
        assert_eq!(report.hashes[0].hash.len(), 32);
        let stages = stages.lock().unwrap();
        assert_eq!(stages.first(), Some(&DumpStage::Reading));
        assert_eq!(stages.last(), Some(&DumpStage::Complete));
        assert!(stages.contains(&DumpStage::Hashing));
    }
}

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use dumpkit_core::scan::LatencyBands;
use dumpkit_core::{
	BlockSource, DeviceKind, DumpConfig, DumpLogHeader, DumpLogWriter, Dumper, HashAlgorithm,
	ImageSource, MediaScanner, ResumeStore, ScanConfig,
};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser, Debug)]
#[command(name = "dumpkit", version, about = "dumpkit - Resumable Media Dumping Tool")]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

/// Identity reported for the source. Image files carry none of their own.
#[derive(Args, Debug)]
struct DeviceArgs {
	/// Logical sector size in bytes
	#[arg(long, default_value = "512")]
	sector_size: u32,
	/// Command set the media was attached through
	#[arg(long, value_parser = ["ata", "atapi", "scsi", "mmc", "sd", "nvme"], default_value = "scsi")]
	kind: String,
	/// Media is removable
	#[arg(long)]
	removable: bool,
	#[arg(long)]
	manufacturer: Option<String>,
	#[arg(long)]
	model: Option<String>,
	#[arg(long)]
	serial: Option<String>,
	#[arg(long)]
	firmware: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Dump a source to a raw image, resuming an earlier run when possible
	Dump {
		/// Device or image to read
		source: PathBuf,
		/// Raw image to write
		output: PathBuf,
		/// Resume document (default: <OUTPUT>.resume.json)
		#[arg(long, conflicts_with = "no_resume")]
		resume: Option<PathBuf>,
		/// Start from scratch and keep no resume document
		#[arg(long)]
		no_resume: bool,
		/// Write an MHDD scan log of the linear pass
		#[arg(long)]
		mhdd_log: Option<PathBuf>,
		#[arg(long, default_value = "64")]
		blocks_per_read: u32,
		/// Single-block retry passes over bad blocks
		#[arg(long, default_value = "1")]
		retry_passes: u32,
		/// Stop at the first read error
		#[arg(long)]
		stop_on_error: bool,
		/// Hash algorithm for the finished image (repeatable)
		#[arg(long = "hash", value_parser = parse_hash)]
		hashes: Vec<HashAlgorithm>,
		/// Print the report as JSON
		#[arg(long)]
		json: bool,
		#[command(flatten)]
		device: DeviceArgs,
	},
	/// Read the whole source and report timing statistics
	Scan {
		source: PathBuf,
		#[arg(long)]
		mhdd_log: Option<PathBuf>,
		#[arg(long, default_value = "64")]
		blocks_per_read: u32,
		/// Seeks in the seek test (0 disables it)
		#[arg(long, default_value = "1000")]
		seek_samples: u32,
		#[arg(long)]
		json: bool,
		#[command(flatten)]
		device: DeviceArgs,
	},
	/// Summarize a resume document
	Inspect {
		resume_file: PathBuf,
		#[arg(long)]
		json: bool,
	},
}

fn parse_hash(s: &str) -> Result<HashAlgorithm, String> {
	s.parse()
}

fn parse_kind(kind: &str) -> DeviceKind {
	match kind {
		"ata" => DeviceKind::Ata,
		"atapi" => DeviceKind::Atapi,
		"mmc" => DeviceKind::MultiMediaCard,
		"sd" => DeviceKind::SecureDigital,
		"nvme" => DeviceKind::Nvme,
		_ => DeviceKind::Scsi,
	}
}

fn open_source(path: &Path, device: &DeviceArgs) -> Result<ImageSource> {
	let source = ImageSource::open(path, device.sector_size)
		.context(format!("Failed to open {}", path.display()))?;

	Ok(source.with_identity(|info| {
		info.kind = parse_kind(&device.kind);
		info.removable = device.removable;
		if let Some(ref manufacturer) = device.manufacturer {
			info.manufacturer = manufacturer.clone();
		}
		if let Some(ref model) = device.model {
			info.model = model.clone();
		}
		if let Some(ref serial) = device.serial {
			info.serial = serial.clone();
		}
		if let Some(ref firmware) = device.firmware {
			info.firmware = firmware.clone();
		}
	}))
}

fn open_log(path: Option<&Path>, source: &ImageSource, blocks_per_read: u32) -> Result<Option<DumpLogWriter>> {
	match path {
		Some(path) => {
			let header = DumpLogHeader::from_device(source.info(), blocks_per_read);
			let log = DumpLogWriter::create(path, &header)
				.context(format!("Failed to create MHDD log {}", path.display()))?;
			Ok(Some(log))
		}
		None => Ok(None),
	}
}

/// A progress bar when stderr is a terminal
fn progress_bar(total_blocks: u64) -> Result<Option<ProgressBar>> {
	if !atty::is(atty::Stream::Stderr) {
		return Ok(None);
	}

	let bar = ProgressBar::new(total_blocks);
	bar.set_style(
		ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} blocks {msg}")?
			.progress_chars("##-"),
	);
	Ok(Some(bar))
}

fn band_labels(bands: &LatencyBands) -> Vec<String> {
	let mut labels: Vec<String> = bands
		.thresholds
		.iter()
		.map(|t| format!("< {} ms", t.as_millis()))
		.collect();
	if let Some(last) = bands.thresholds.last() {
		labels.push(format!(">= {} ms", last.as_millis()));
	}
	labels
}

fn main() -> Result<()> {
	// Initialize tracing
	tracing_subscriber::fmt::init();

	let cli = Cli::parse();
	match cli.command {
		Commands::Dump {
			source,
			output,
			resume,
			no_resume,
			mhdd_log,
			blocks_per_read,
			retry_passes,
			stop_on_error,
			hashes,
			json,
			device,
		} => {
			let source = open_source(&source, &device)?;
			let store = if no_resume {
				None
			} else {
				Some(resume.map(ResumeStore::new).unwrap_or_else(|| ResumeStore::for_image(&output)))
			};
			let mut log = open_log(mhdd_log.as_deref(), &source, blocks_per_read)?;

			let mut config = DumpConfig {
				blocks_per_read,
				retry_passes,
				stop_on_error,
				..Default::default()
			};
			if !hashes.is_empty() {
				config.hash_algorithms = hashes;
			}

			let total_blocks = source.info().block_count;
			let mut dumper = Dumper::new(source, config);
			let bar = progress_bar(total_blocks)?;
			if let Some(bar) = bar.clone() {
				dumper.set_progress_callback(move |progress| {
					bar.set_position(progress.current_block);
					bar.set_message(format!("{} bad", progress.bad_blocks));
				});
			}

			let result = dumper.run(&output, store.as_ref(), log.as_mut());
			if let Some(bar) = bar {
				bar.finish_and_clear();
			}
			if let Some(log) = log.as_mut() {
				log.close()?;
			}
			let report = result?;

			if json {
				println!("{}", serde_json::to_string_pretty(&report)?);
				return Ok(());
			}

			if report.is_complete() {
				println!("✅ Dump completed successfully!");
			} else if report.stopped_on_error {
				println!("⛔ Dump stopped at the first read error");
			} else {
				println!("⚠️  Dump finished with unreadable blocks");
			}
			println!("💾 Image: {}", report.output.display());
			if let Some(ref resume_file) = report.resume_file {
				println!("📝 Resume file: {}", resume_file.display());
			}
			if report.resumed {
				println!("🔄 Resumed attempt #{}", report.attempt + 1);
			}
			println!("📊 Captured: {}/{} blocks", report.captured_blocks, report.total_blocks);
			println!("📖 Read this run: {} blocks", report.blocks_read);
			println!("❌ Bad blocks: {}", report.bad_blocks.len());
			println!("⚡ Average speed: {:.2} MiB/s", report.scan.avg_speed);
			for hash in &report.hashes {
				println!("🔐 {}: {}", hash.algorithm.name(), hash.hash);
			}
		}
		Commands::Scan {
			source,
			mhdd_log,
			blocks_per_read,
			seek_samples,
			json,
			device,
		} => {
			let source = open_source(&source, &device)?;
			let mut log = open_log(mhdd_log.as_deref(), &source, blocks_per_read)?;

			let config = ScanConfig {
				blocks_per_read,
				seek_samples,
				..Default::default()
			};
			let bands = config.latency_bands.unwrap_or_default();

			let total_blocks = source.info().block_count;
			let mut scanner = MediaScanner::new(source, config);
			let bar = progress_bar(total_blocks)?;
			if let Some(bar) = bar.clone() {
				scanner.set_progress_callback(move |progress| {
					bar.set_position(progress.current_block);
					bar.set_message(format!("{:.2} MiB/s", progress.current_speed));
				});
			}

			let results = scanner.scan(log.as_mut());
			if let Some(bar) = bar {
				bar.finish_and_clear();
			}
			if let Some(log) = log.as_mut() {
				log.close()?;
			}

			if json {
				println!("{}", serde_json::to_string_pretty(&results)?);
				return Ok(());
			}

			println!("✅ Scan completed");
			println!("📊 Blocks: {}", results.blocks);
			println!("❌ Unreadable: {}", results.errored);
			println!(
				"⚡ Speed: avg {:.2} / min {:.2} / max {:.2} MiB/s",
				results.avg_speed, results.min_speed, results.max_speed
			);
			println!("⏱️  Read time: {:.1}s", results.processing_time.as_secs_f64());
			for (label, count) in band_labels(&bands).iter().zip(results.counters.iter()) {
				println!("   {:>10}: {}", label, count);
			}
			if let Some(avg) = results.avg_seek() {
				println!(
					"🎯 Seeks: {} (avg {:.3} ms)",
					results.seek_times,
					avg.as_secs_f64() * 1000.0
				);
			}
		}
		Commands::Inspect { resume_file, json } => {
			let store = ResumeStore::new(&resume_file);
			let Some(state) = store.load()? else {
				bail!("No resume document at {}", resume_file.display());
			};

			if json {
				println!("{}", serde_json::to_string_pretty(&state)?);
				return Ok(());
			}

			println!("📝 Resume document: {}", resume_file.display());
			println!("💽 Removable: {}", state.removable);
			println!("📏 Blocks: {} (last block {})", state.block_count(), state.last_block);
			println!("📅 Created: {}", state.creation_date);
			if let Some(last_write) = state.last_write_date {
				println!("📅 Last written: {}", last_write);
			}
			println!("▶️  Next block: {}", state.next_block);
			println!("❌ Bad blocks: {}", state.bad_blocks.len());
			for (i, attempt) in state.tries.iter().enumerate() {
				let covered = attempt
					.extents
					.iter()
					.fold(0u64, |total, extent| total.saturating_add(extent.span()));
				let inverted = attempt.extents.iter().filter(|e| e.is_inverted()).count();
				println!();
				println!(
					"Attempt #{}: {} {} (S/N {})",
					i + 1,
					attempt.manufacturer,
					attempt.model,
					attempt.serial
				);
				match attempt.software {
					Some(ref software) => println!("   Software: {}", software),
					None => println!("   Software: unknown"),
				}
				println!("   Captured: {} blocks in {} extents", covered, attempt.extents.len());
				if inverted > 0 {
					println!("   ⚠️  {} damaged extents (start after end) ignored", inverted);
				}
				for extent in &attempt.extents {
					if extent.is_inverted() {
						println!("     {}-{} (damaged)", extent.start, extent.end);
					} else {
						println!("     {}-{}", extent.start, extent.end);
					}
				}
			}
		}
	}
	Ok(())
}

use anyhow::{Context, Result};
use std::path::Path;

pub mod device;
pub mod dump;
pub mod dumplog;
pub mod extents;
pub mod resume;
pub mod scan;
pub mod verification;

// Re-export the types most callers need
pub use device::{BlockSource, DeviceError, DeviceInfo, DeviceKind, ImageSource};
pub use dump::{DumpConfig, DumpProgress, DumpReport, DumpStage, Dumper};
pub use dumplog::{DumpLogHeader, DumpLogWriter};
pub use extents::{Extent, ExtentIndex, ExtentMap};
pub use resume::{
    DumpHardwareAttempt, ResumeError, ResumeReconciler, ResumeSession, ResumeState, ResumeStore,
    SoftwareIdentity,
};
pub use scan::{MediaScanner, ScanConfig, ScanResults};
pub use verification::{HashAlgorithm, ImageHash};

/// Dump a source into `output`, resuming from `<output>.resume.json` if it
/// describes the same media
pub fn dump_with_resume<S: BlockSource>(
    source: S,
    output: &Path,
    config: DumpConfig,
) -> Result<DumpReport> {
    let store = ResumeStore::for_image(output);
    tracing::info!(
        "Starting dump to {} (resume file {})",
        output.display(),
        store.path().display()
    );

    let mut dumper = Dumper::new(source, config);
    dumper.run(output, Some(&store), None)
}

/// Surface-scan a raw image file
pub fn scan_image(image_path: &Path, block_size: u32, config: ScanConfig) -> Result<ScanResults> {
    let source = ImageSource::open(image_path, block_size)
        .context(format!("Failed to open image {}", image_path.display()))?;

    let mut scanner = MediaScanner::new(source, config);
    Ok(scanner.scan(None))
}

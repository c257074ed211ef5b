/// Media scanning: timing statistics and the read-only scan driver
pub mod accumulator;
pub mod scanner;

pub use accumulator::{LatencyBands, ScanAccumulator, ScanResults};
pub use scanner::{MediaScanner, ScanConfig};

/// Resumable acquisition of a block source into a raw image
pub mod config;
pub mod engine;

pub use config::DumpConfig;
pub use engine::{DumpProgress, DumpReport, DumpStage, Dumper};

//! Persisted resume document
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::extents::Extent;

/// Name every attempt written by this tool is stamped with
pub const TOOL_NAME: &str = "dumpkit";

/// Identity of the software that produced an attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareIdentity {
    pub name: String,
    pub operating_system: String,
    pub version: String,
}

impl SoftwareIdentity {
    pub fn new(
        name: impl Into<String>,
        operating_system: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            operating_system: operating_system.into(),
            version: version.into(),
        }
    }

    /// The running build of this tool on the current platform
    pub fn current() -> Self {
        Self::new(
            TOOL_NAME,
            std::env::consts::OS,
            env!("CARGO_PKG_VERSION"),
        )
    }
}

impl std::fmt::Display for SoftwareIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.name, self.version, self.operating_system)
    }
}

/// One recorded run of a dump: who read what, with which software
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpHardwareAttempt {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    /// `None` only in damaged documents
    #[serde(default)]
    pub software: Option<SoftwareIdentity>,
    /// Sectors captured during this run
    #[serde(default)]
    pub extents: Vec<Extent<u64>>,
}

impl DumpHardwareAttempt {
    pub fn new(
        manufacturer: impl Into<String>,
        model: impl Into<String>,
        serial: impl Into<String>,
        software: SoftwareIdentity,
    ) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            model: model.into(),
            serial: serial.into(),
            software: Some(software),
            extents: Vec::new(),
        }
    }

    pub fn same_hardware(&self, manufacturer: &str, model: &str, serial: &str) -> bool {
        self.manufacturer == manufacturer && self.model == model && self.serial == serial
    }
}

/// Top-level resume document for one target device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub removable: bool,
    /// Device capacity in blocks minus one
    pub last_block: u64,
    pub creation_date: DateTime<Utc>,
    #[serde(default)]
    pub last_write_date: Option<DateTime<Utc>>,
    /// First block the linear pass has not reached yet
    #[serde(default)]
    pub next_block: u64,
    /// Blocks that failed to read, across all attempts
    #[serde(default)]
    pub bad_blocks: BTreeSet<u64>,
    #[serde(default)]
    pub tries: Vec<DumpHardwareAttempt>,
}

impl ResumeState {
    pub fn new(removable: bool, last_block: u64) -> Self {
        Self {
            removable,
            last_block,
            creation_date: Utc::now(),
            last_write_date: None,
            next_block: 0,
            bad_blocks: BTreeSet::new(),
            tries: Vec::new(),
        }
    }

    /// Number of blocks on the device this document describes
    pub fn block_count(&self) -> u64 {
        self.last_block.saturating_add(1)
    }
}

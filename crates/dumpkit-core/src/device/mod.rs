//! Device model and block sources
//!
//! The low-level command transports (ATA, SCSI, MMC, NVMe) live outside this
//! crate. Anything that can hand out fixed-size blocks by LBA implements
//! [`BlockSource`] and can be dumped or scanned.

pub mod image;

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use crate::resume::DeviceProbe;

pub use image::ImageSource;

/// Command set a device is driven through
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Ata,
    Atapi,
    Scsi,
    MultiMediaCard,
    SecureDigital,
    Nvme,
}

impl DeviceKind {
    /// Mode tag used in MHDD scan logs
    pub fn log_mode(&self) -> &'static str {
        match self {
            DeviceKind::Ata => "IDE",
            DeviceKind::Atapi | DeviceKind::Scsi => "SCSI",
            DeviceKind::MultiMediaCard => "MMC",
            DeviceKind::SecureDigital => "SD",
            DeviceKind::Nvme => "NVMe",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Ata => write!(f, "ATA"),
            DeviceKind::Atapi => write!(f, "ATAPI"),
            DeviceKind::Scsi => write!(f, "SCSI"),
            DeviceKind::MultiMediaCard => write!(f, "MMC"),
            DeviceKind::SecureDigital => write!(f, "SD"),
            DeviceKind::Nvme => write!(f, "NVMe"),
        }
    }
}

/// Identity and geometry of a device as reported by its probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub block_size: u32,
    pub block_count: u64,
    pub removable: bool,
    /// Logical block addressing; `false` means CHS only
    pub is_lba: bool,
}

impl DeviceInfo {
    /// Total capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.block_count * self.block_size as u64
    }

    /// The subset of the identity the resume reconciler checks
    pub fn probe(&self) -> DeviceProbe {
        DeviceProbe {
            is_lba: self.is_lba,
            removable: self.removable,
            block_count: self.block_count,
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            serial: self.serial.clone(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Block size must be a non-zero value, got {0}")]
    InvalidBlockSize(u32),
    #[error("Source is smaller than one {0}-byte block")]
    TooSmall(u32),
    #[error("Read of {count} blocks at {lba} is beyond the last block {last}")]
    OutOfRange { lba: u64, count: u32, last: u64 },
}

impl From<DeviceError> for io::Error {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidInput, other),
        }
    }
}

/// A device that can be read block by block
pub trait BlockSource {
    fn info(&self) -> &DeviceInfo;

    /// Read `count` consecutive blocks starting at `lba`.
    ///
    /// Errors are per-read: callers record them and move on.
    fn read_blocks(&mut self, lba: u64, count: u32) -> io::Result<Vec<u8>>;

    /// Position the head at `lba`. Sources without a native seek read one block.
    fn seek(&mut self, lba: u64) -> io::Result<()> {
        self.read_blocks(lba, 1).map(|_| ())
    }
}

impl<S: BlockSource + ?Sized> BlockSource for Box<S> {
    fn info(&self) -> &DeviceInfo {
        (**self).info()
    }

    fn read_blocks(&mut self, lba: u64, count: u32) -> io::Result<Vec<u8>> {
        (**self).read_blocks(lba, count)
    }

    fn seek(&mut self, lba: u64) -> io::Result<()> {
        (**self).seek(lba)
    }
}

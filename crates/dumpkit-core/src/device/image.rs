//! Raw image files as block sources
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io;
use std::path::Path;

use super::{BlockSource, DeviceError, DeviceInfo, DeviceKind};

/// A memory-mapped raw image presented as a block device
pub struct ImageSource {
    _file: File,
    mmap: Mmap,
    info: DeviceInfo,
}

impl ImageSource {
    /// Open an image file with the given logical block size.
    ///
    /// Trailing bytes that do not fill a whole block are not addressable.
    pub fn open<P: AsRef<Path>>(path: P, block_size: u32) -> Result<Self, DeviceError> {
        if block_size == 0 {
            return Err(DeviceError::InvalidBlockSize(block_size));
        }

        let file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();
        let block_count = size / block_size as u64;
        if block_count == 0 {
            return Err(DeviceError::TooSmall(block_size));
        }

        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let model = path
            .as_ref()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        tracing::debug!(
            "Opened image {} ({} blocks of {} bytes)",
            path.as_ref().display(),
            block_count,
            block_size
        );

        Ok(Self {
            _file: file,
            mmap,
            info: DeviceInfo {
                kind: DeviceKind::Scsi,
                manufacturer: String::new(),
                model,
                serial: String::new(),
                firmware: String::new(),
                block_size,
                block_count,
                removable: false,
                is_lba: true,
            },
        })
    }

    /// Override the reported identity, e.g. with values from a prior probe
    pub fn with_identity(mut self, update: impl FnOnce(&mut DeviceInfo)) -> Self {
        let block_size = self.info.block_size;
        let block_count = self.info.block_count;
        update(&mut self.info);
        // Geometry is a property of the file, not of the caller
        self.info.block_size = block_size;
        self.info.block_count = block_count;
        self
    }

    fn read_slice(&self, lba: u64, count: u32) -> Result<&[u8], DeviceError> {
        let last = self.info.block_count - 1;
        let end_block = lba.checked_add(count as u64);
        match end_block {
            Some(end) if count > 0 && end <= self.info.block_count => {
                let bs = self.info.block_size as u64;
                Ok(&self.mmap[(lba * bs) as usize..(end * bs) as usize])
            }
            _ => Err(DeviceError::OutOfRange { lba, count, last }),
        }
    }
}

impl BlockSource for ImageSource {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read_blocks(&mut self, lba: u64, count: u32) -> io::Result<Vec<u8>> {
        Ok(self.read_slice(lba, count)?.to_vec())
    }

    fn seek(&mut self, lba: u64) -> io::Result<()> {
        self.read_slice(lba, 1)?;
        Ok(())
    }
}

//! MHDD-compatible scan logs
//!
//! Layout: a little-endian `u32` holding the offset of the first record, a
//! CRLF-terminated ASCII preamble, then fixed 16-byte records of
//! `(sector: u64 LE, duration_ms: u64 LE)`.

use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::{DeviceInfo, DeviceKind};

/// Size of one record
pub const RECORD_SIZE: usize = 16;

const LOG_VERSION: u32 = 2;

/// Duration recorded for failed reads that returned quickly
pub const ERROR_MARK: Duration = Duration::from_millis(65_535);

/// Duration to log for a failed read. Viewers paint anything this slow as an
/// error, so quick failures are raised to [`ERROR_MARK`].
pub fn failed_read_duration(duration: Duration) -> Duration {
    if duration < Duration::from_millis(500) {
        ERROR_MARK
    } else {
        duration
    }
}

/// Device description written into the preamble
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpLogHeader {
    pub kind: DeviceKind,
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,
    pub serial: String,
    pub sectors: u64,
    pub sector_size: u32,
    pub scan_block_size: u32,
}

impl DumpLogHeader {
    pub fn from_device(info: &DeviceInfo, scan_block_size: u32) -> Self {
        Self {
            kind: info.kind,
            manufacturer: info.manufacturer.clone(),
            model: info.model.clone(),
            firmware: info.firmware.clone(),
            serial: info.serial.clone(),
            sectors: info.block_count,
            sector_size: info.block_size,
            scan_block_size,
        }
    }

    /// Blank the serial number, for logs that will be shared
    pub fn redact_serial(mut self) -> Self {
        self.serial.clear();
        self
    }

    /// Text part of the preamble, without the leading offset field
    pub fn text(&self) -> String {
        format!(
            "VER:{} \r\nMODE: {}\r\nDEVICE: {} {}\r\nF/W: {}\r\nS/N: {}\r\nSECTORS: {}\r\nSECTOR SIZE: {} bytes\r\nSCAN BLOCK SIZE: {} sectors\r\n",
            LOG_VERSION,
            self.kind.log_mode(),
            self.manufacturer,
            self.model,
            self.firmware,
            self.serial,
            group_thousands(self.sectors),
            group_thousands(self.sector_size as u64),
            group_thousands(self.scan_block_size as u64),
        )
    }

    /// Complete preamble: offset field plus text
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let text = self.text();
        let total = 4 + text.len();
        let offset = u32::try_from(total)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Log preamble too large"))?;

        let mut out = Vec::with_capacity(total);
        out.write_u32::<LittleEndian>(offset)?;
        out.extend_from_slice(text.as_bytes());
        Ok(out)
    }
}

/// Decimal with comma thousands separators, e.g. `1,234,567`
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Append-only writer for one scan log file
pub struct DumpLogWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    records: u64,
}

impl DumpLogWriter {
    /// Create (truncating) the log and write its preamble
    pub fn create(path: impl AsRef<Path>, header: &DumpLogHeader) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufWriter::new(File::create(&path)?);
        file.write_all(&header.encode()?)?;

        tracing::debug!("Writing MHDD log to {}", path.display());

        Ok(Self {
            path,
            file: Some(file),
            records: 0,
        })
    }

    /// Append one record. Does nothing once the log is closed.
    ///
    /// A failed write abandons the file: the error is returned once and the
    /// log behaves as closed afterwards.
    pub fn write(&mut self, sector: u64, duration: Duration) -> io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let result = file
            .write_u64::<LittleEndian>(sector)
            .and_then(|_| file.write_u64::<LittleEndian>(millis));

        match result {
            Ok(()) => {
                self.records += 1;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "Abandoning MHDD log {} after write error: {}",
                    self.path.display(),
                    e
                );
                self.abandon();
                Err(e)
            }
        }
    }

    /// Drop the file without flushing what is still buffered
    fn abandon(&mut self) {
        if let Some(file) = self.file.take() {
            // Unflushed records are discarded, not retried on drop
            let _ = file.into_parts();
        }
    }

    /// Flush and release the file. Later calls are no-ops.
    pub fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            tracing::debug!(
                "Closed MHDD log {} with {} records",
                self.path.display(),
                self.records
            );
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DumpLogWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close MHDD log {}: {}", self.path.display(), e);
        }
    }
}

//! Durable storage for resume documents

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::state::ResumeState;

/// JSON resume document on disk.
///
/// Saves go to a sibling temporary file which is then renamed over the
/// target, so an interrupted save leaves the previous document intact.
pub struct ResumeStore {
    path: PathBuf,
}

impl ResumeStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Conventional resume file for an output image (`<image>.resume.json`)
    pub fn for_image(image: impl AsRef<Path>) -> Self {
        let mut name = image.as_ref().as_os_str().to_os_string();
        name.push(".resume.json");
        Self::new(PathBuf::from(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Load the stored document, or `None` when there is nothing to resume
    pub fn load(&self) -> Result<Option<ResumeState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let file = File::open(&self.path)
            .context(format!("Failed to open resume file {}", self.path.display()))?;
        let state = serde_json::from_reader(BufReader::new(file))
            .context(format!("Failed to parse resume file {}", self.path.display()))?;

        Ok(Some(state))
    }

    /// Atomically replace the stored document
    pub fn save(&self, state: &ResumeState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create resume file directory")?;
        }

        let temp = self.temp_path();
        {
            let file = File::create(&temp)
                .context(format!("Failed to create {}", temp.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, state)
                .context("Failed to serialize resume state")?;
            writer.flush()?;
            writer
                .get_ref()
                .sync_all()
                .context("Failed to sync resume file")?;
        }

        fs::rename(&temp, &self.path).context(format!(
            "Failed to move resume file into place at {}",
            self.path.display()
        ))?;

        tracing::debug!(
            "Saved resume state ({} bad blocks, next block {}) to {}",
            state.bad_blocks.len(),
            state.next_block,
            self.path.display()
        );

        Ok(())
    }

    /// Remove the stored document, e.g. once a dump completed cleanly
    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .context(format!("Failed to delete {}", self.path.display()))?;
        }
        Ok(())
    }
}

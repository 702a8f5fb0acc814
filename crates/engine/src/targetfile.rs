//! The file a download writes into: opened once, written at
//! arbitrary offsets by concurrent slots, closed once (SPEC_FULL.md
//! §4.1).

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::DownloadError;

pub struct TargetFile {
    path: PathBuf,
    opened_file: Mutex<Option<File>>,
}

impl TargetFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            opened_file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the target file for random-access writing, creating it
    /// if necessary. A no-op if already open.
    pub fn open(&self) -> Result<(), DownloadError> {
        let mut guard = self.opened_file.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(DownloadError::TargetFileIo)?;
        *guard = Some(file);
        Ok(())
    }

    /// Writes `data` at `offset`, serialized against concurrent
    /// writers from sibling slots.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), DownloadError> {
        let mut guard = self.opened_file.lock().unwrap();
        let file = guard
            .as_mut()
            .ok_or_else(|| DownloadError::MissingTempFile(self.path.display().to_string()))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(DownloadError::TargetFileIo)?;
        file.write_all(data).map_err(DownloadError::TargetFileIo)?;
        Ok(())
    }

    pub fn close(&self) -> Result<(), DownloadError> {
        let mut guard = self.opened_file.lock().unwrap();
        *guard = None;
        Ok(())
    }
}

//! Dated log files on a mounted filesystem

use crate::{session_name, PersistentStorage, StorageError};
use sample_cache::{OverflowSink, SinkError};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Append log writing one file per day under a root directory
pub struct FileStorage {
    root: PathBuf,
    mounted: bool,
    writer: Option<BufWriter<File>>,
    /// Bytes in the open day's file
    size: u64,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mounted: false,
            writer: None,
            size: 0,
        }
    }
}

impl PersistentStorage for FileStorage {
    fn init(&mut self) -> Result<(), StorageError> {
        let meta = std::fs::metadata(&self.root)
            .map_err(|e| StorageError::Unavailable(format!("{}: {}", self.root.display(), e)))?;
        if !meta.is_dir() || meta.permissions().readonly() {
            return Err(StorageError::Unavailable(format!(
                "{} is not a writable directory",
                self.root.display()
            )));
        }
        self.mounted = true;
        info!("Storage mounted at {}", self.root.display());
        Ok(())
    }

    fn begin(&mut self, date: u32) -> Result<(), StorageError> {
        if !self.mounted {
            return Err(StorageError::NotInitialized);
        }
        self.end();
        let path = self.root.join(session_name(date));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.size = file.metadata()?.len();
        self.writer = Some(BufWriter::new(file));
        info!("Storage session {} opened ({} bytes)", path.display(), self.size);
        Ok(())
    }

    fn end(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("Storage flush failed: {}", e);
            }
            debug!("Storage session closed at {} bytes", self.size);
        }
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

impl OverflowSink for FileStorage {
    fn persist(&mut self, frame: &[u8]) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::NotOpen)?;
        writer.write_all(frame)?;
        writer.write_all(b"\n")?;
        self.size += frame.len() as u64 + 1;
        Ok(())
    }

    fn size_bytes(&self) -> u64 {
        self.size
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_media_is_soft_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().join("absent"));
        assert!(storage.init().is_err());
        assert!(!dir.path().join("absent").exists());
        assert!(matches!(storage.begin(10125), Err(StorageError::NotInitialized)));
    }

    #[test]
    fn test_session_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path());
        storage.init().unwrap();

        storage.begin(180226).unwrap();
        storage.persist(b"1A#0=1,10D=5*00").unwrap();
        assert_eq!(storage.size_bytes(), 16);
        storage.end();
        assert!(!storage.is_open());

        let written = std::fs::read_to_string(dir.path().join("180226.TXT")).unwrap();
        assert_eq!(written, "1A#0=1,10D=5*00\n");

        storage.begin(190226).unwrap();
        assert_eq!(storage.size_bytes(), 0);
        assert!(dir.path().join("190226.TXT").exists());
    }

    #[test]
    fn test_persist_requires_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path());
        storage.init().unwrap();
        assert!(matches!(storage.persist(b"x"), Err(SinkError::NotOpen)));
    }
}

//! In-memory storage backend

use crate::{session_name, PersistentStorage, StorageError};
use sample_cache::{OverflowSink, SinkError};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Contents of a [`MemoryStorage`], shared with whoever holds a handle
#[derive(Debug, Default)]
pub struct MemoryLog {
    /// Closed and open sessions, oldest first
    pub sessions: Vec<(String, Vec<u8>)>,
    pub open: bool,
    pub end_calls: usize,
}

/// Storage kept in RAM; used on bench hosts and in tests
pub struct MemoryStorage {
    log: Arc<Mutex<MemoryLog>>,
    available: bool,
    mounted: bool,
    size: u64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(MemoryLog::default())),
            available: true,
            mounted: false,
            size: 0,
        }
    }

    /// Storage whose media is missing: `init` always fails
    pub fn absent() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Shared view of the stored sessions
    pub fn handle(&self) -> Arc<Mutex<MemoryLog>> {
        Arc::clone(&self.log)
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut MemoryLog) -> T) -> Result<T, StorageError> {
        let mut log = self
            .log
            .lock()
            .map_err(|e| StorageError::Io(format!("Lock error: {}", e)))?;
        Ok(f(&mut log))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentStorage for MemoryStorage {
    fn init(&mut self) -> Result<(), StorageError> {
        if !self.available {
            return Err(StorageError::Unavailable("no media".to_string()));
        }
        self.mounted = true;
        info!("Memory storage ready");
        Ok(())
    }

    fn begin(&mut self, date: u32) -> Result<(), StorageError> {
        if !self.mounted {
            return Err(StorageError::NotInitialized);
        }
        let name = session_name(date);
        self.size = self.with_log(|log| {
            log.open = true;
            match log.sessions.iter().position(|(n, _)| *n == name) {
                Some(i) => {
                    let session = log.sessions.remove(i);
                    let size = session.1.len() as u64;
                    log.sessions.push(session);
                    size
                }
                None => {
                    log.sessions.push((name, Vec::new()));
                    0
                }
            }
        })?;
        Ok(())
    }

    fn end(&mut self) {
        let closed = self.with_log(|log| {
            if log.open {
                debug!("Memory storage session closed");
            }
            log.open = false;
            log.end_calls += 1;
        });
        if let Err(e) = closed {
            warn!("Memory storage session not closed: {}", e);
        }
    }

    fn is_open(&self) -> bool {
        self.with_log(|log| log.open).unwrap_or(false)
    }
}

impl OverflowSink for MemoryStorage {
    fn persist(&mut self, frame: &[u8]) -> Result<(), SinkError> {
        let written = self
            .with_log(|log| {
                if !log.open {
                    return Err(SinkError::NotOpen);
                }
                let session = log.sessions.last_mut().ok_or(SinkError::NotOpen)?;
                session.1.extend_from_slice(frame);
                session.1.push(b'\n');
                Ok(frame.len() as u64 + 1)
            })
            .map_err(|e| SinkError::Io(e.to_string()))??;
        self.size += written;
        Ok(())
    }

    fn size_bytes(&self) -> u64 {
        self.size
    }
}

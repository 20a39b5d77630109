//! Byte-oriented sample cache

use crate::sink::{OverflowSink, SinkError};
use crate::{Sample, SampleKey};
use std::fmt::Write as _;
use tracing::{debug, trace};
use wire_protocol::frame;

/// Default cache capacity in bytes
pub const DEFAULT_CAPACITY: usize = 1024;

/// Bounded text buffer of framed samples
///
/// Lifecycle: `open` writes the feed header, `append` adds samples,
/// `seal` adds the checksum tailer before transmission. After a failed send
/// `unseal` restores the exact pre-seal bytes so appends resume; after a
/// successful send `rotate` mirrors the frame into the overflow sink (when
/// forwarding) and reopens.
pub struct SampleCache {
    buf: Vec<u8>,
    capacity: usize,
    feed_id: u16,
    samples: usize,
    last_timestamp: Option<u32>,
    /// Length before the tailer was appended
    sealed_at: Option<usize>,
    forward: bool,
    dropped: u64,
}

impl SampleCache {
    /// Create a cache bounded to `capacity` bytes, opened for feed 0
    pub fn new(capacity: usize) -> Self {
        let mut cache = Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            feed_id: 0,
            samples: 0,
            last_timestamp: None,
            sealed_at: None,
            forward: false,
            dropped: 0,
        };
        cache.open(0);
        cache
    }

    /// Reset the buffer and write the `<feed>#` header
    pub fn open(&mut self, feed_id: u16) {
        self.buf.clear();
        let _ = write!(Bytes(&mut self.buf), "{:X}#", feed_id);
        self.feed_id = feed_id;
        self.samples = 0;
        self.last_timestamp = None;
        self.sealed_at = None;
    }

    /// Encode a sample into the buffer
    ///
    /// Returns `false` and drops the sample when it would not fit (the
    /// tailer's room is always reserved) or while the cache is sealed.
    pub fn append(&mut self, sample: &Sample) -> bool {
        if self.sealed_at.is_some() {
            debug!("Cache sealed, dropping sample {}", sample.key);
            return false;
        }

        let mut entry = String::new();
        if self.last_timestamp != Some(sample.timestamp_ms) {
            let _ = write!(entry, "{}={},", SampleKey::TIMESTAMP, sample.timestamp_ms);
        }
        let _ = write!(entry, "{}={}", sample.key, sample.value);

        let separator = usize::from(self.samples > 0 || self.last_timestamp.is_some());
        if self.buf.len() + separator + entry.len() + frame::TRAILER_LEN > self.capacity {
            self.dropped += 1;
            metrics::counter!("telemetry_samples_dropped_total").increment(1);
            trace!("Cache full, dropping sample {}", sample.key);
            return false;
        }

        if separator == 1 {
            self.buf.push(b',');
        }
        self.buf.extend_from_slice(entry.as_bytes());
        self.last_timestamp = Some(sample.timestamp_ms);
        self.samples += 1;
        true
    }

    /// Append the checksum tailer and return the sealed length
    pub fn seal(&mut self) -> usize {
        if self.sealed_at.is_none() {
            self.sealed_at = Some(self.buf.len());
            frame::seal(&mut self.buf);
        }
        self.buf.len()
    }

    /// Strip the tailer so appends can resume
    pub fn unseal(&mut self) {
        if let Some(len) = self.sealed_at.take() {
            self.buf.truncate(len);
        }
    }

    /// Mirror the current frame into `sink` (when forwarding) and reopen
    ///
    /// The cache is reopened even when the sink rejects the frame.
    pub fn rotate<S>(&mut self, feed_id: u16, sink: Option<&mut S>) -> Result<(), SinkError>
    where
        S: OverflowSink + ?Sized,
    {
        let result = match sink {
            Some(sink) if self.forward && self.samples > 0 => {
                self.seal();
                sink.persist(&self.buf)
            }
            _ => Ok(()),
        };
        self.open(feed_id);
        result
    }

    /// Mirror rotations into the overflow sink
    pub fn set_forward(&mut self, enabled: bool) {
        self.forward = enabled;
    }

    pub fn is_forwarding(&self) -> bool {
        self.forward
    }

    /// Number of samples since the last `open`
    pub fn sample_count(&self) -> usize {
        self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed_at.is_some()
    }

    /// Current frame bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Feed identifier written in the current header
    pub fn feed_id(&self) -> u16 {
        self.feed_id
    }

    /// Samples dropped because the cache was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// `fmt::Write` adapter over a byte buffer
struct Bytes<'a>(&'a mut Vec<u8>);

impl std::fmt::Write for Bytes<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.0.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

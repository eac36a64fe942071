//! Append-only capture of every byte received in a session.

use parking_lot::Mutex;

use crate::config::PcmFormat;

/// Session recording used for WAV export.
///
/// The lock is held only for a memcpy; it is never taken by the output
/// callback and never held across network I/O. Playback consumption does not
/// touch it; only an explicit reset or clear empties it.
#[derive(Debug, Default)]
pub struct RecordingAccumulator {
    bytes: Mutex<Vec<u8>>,
}

impl RecordingAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, data: &[u8]) {
        self.bytes.lock().extend_from_slice(data);
    }

    /// Full copy of the recording so far.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn clear(&self) {
        let mut bytes = self.bytes.lock();
        bytes.clear();
        bytes.shrink_to_fit();
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duration_secs(&self, format: PcmFormat) -> f64 {
        format.duration_secs(self.len())
    }
}

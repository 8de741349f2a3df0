/// Upload progress, shared between the session and whoever displays it.
/// All fields are atomic for lock-free reads from another thread.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Session state constants.
pub const STATE_IDLE: u8 = 0;
pub const STATE_HEADER: u8 = 1;
pub const STATE_CHUNKS: u8 = 2;
pub const STATE_FINAL: u8 = 3;
pub const STATE_COMPLETE: u8 = 4;
pub const STATE_ERROR: u8 = 5;

pub struct UploadProgress {
    pub bytes_done: AtomicU64,
    pub bytes_total: AtomicU64,
    pub chunks_sent: AtomicU64,
    pub chunk_size: AtomicU64,
    pub ack_timeouts: AtomicU64,
    pub device_errors: AtomicU64,
    pub retries: AtomicU64,
    pub state: AtomicU8,
}

impl UploadProgress {
    pub fn new() -> Self {
        Self {
            bytes_done: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            chunks_sent: AtomicU64::new(0),
            chunk_size: AtomicU64::new(0),
            ack_timeouts: AtomicU64::new(0),
            device_errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            state: AtomicU8::new(STATE_IDLE),
        }
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Relaxed)
    }

    /// Progress as a fraction 0.0 - 1.0.
    pub fn fraction(&self) -> f64 {
        let total = self.bytes_total.load(Ordering::Relaxed);
        if total == 0 {
            return if self.state() == STATE_COMPLETE { 1.0 } else { 0.0 };
        }
        let done = self.bytes_done.load(Ordering::Relaxed);
        (done as f64 / total as f64).min(1.0)
    }
}

impl Default for UploadProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_tracks_bytes() {
        let p = UploadProgress::new();
        assert_eq!(p.fraction(), 0.0);
        p.bytes_total.store(1000, Ordering::Relaxed);
        p.bytes_done.store(250, Ordering::Relaxed);
        assert!((p.fraction() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_file_complete_is_full() {
        let p = UploadProgress::new();
        p.state.store(STATE_COMPLETE, Ordering::Relaxed);
        assert_eq!(p.fraction(), 1.0);
    }
}

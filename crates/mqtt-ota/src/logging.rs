/// Upload logging trait for structured progress reporting.
///
/// The session emits one `UploadLog` per protocol step. Callers pick where
/// they go: `tracing`, a UI, or nowhere.

use std::fmt;

use crate::error::Stage;

/// Structured log entry for one upload session.
#[derive(Debug, Clone)]
pub struct UploadLog {
    pub session_id: u8,
    pub event: UploadEvent,
}

/// Upload events that can be logged.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Header published
    Started {
        file: String,
        file_size: u64,
        file_type: u32,
        chunk_size: usize,
    },
    /// Device lowered or raised the chunk size in its header acknowledgment
    ChunkSizeNegotiated {
        old_size: usize,
        new_size: usize,
    },
    /// Chunk published
    ChunkSent {
        offset: u64,
        len: usize,
    },
    /// Acknowledgment did not arrive in time
    AckTimeout {
        stage: Stage,
        device_error: bool,
    },
    /// Device answered with an error
    DeviceError {
        stage: Stage,
    },
    /// Same message published again
    Retry {
        stage: Stage,
        attempt: u32,
    },
    /// Final digest published
    DigestSent {
        md5: String,
    },
    /// Session finished
    Complete {
        bytes_sent: u64,
        chunks_sent: u64,
        duration_ms: u64,
    },
}

impl fmt::Display for UploadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { file, file_size, file_type, chunk_size } => {
                write!(f, "started file={} size={} type={} chunk_size={}", file, file_size, file_type, chunk_size)
            }
            Self::ChunkSizeNegotiated { old_size, new_size } => {
                write!(f, "chunk_size_negotiated old={} new={}", old_size, new_size)
            }
            Self::ChunkSent { offset, len } => {
                write!(f, "chunk_sent offset={} len={}", offset, len)
            }
            Self::AckTimeout { stage, device_error } => {
                write!(f, "ack_timeout stage={} device_error={}", stage, device_error)
            }
            Self::DeviceError { stage } => {
                write!(f, "device_error stage={}", stage)
            }
            Self::Retry { stage, attempt } => {
                write!(f, "retry stage={} attempt={}", stage, attempt)
            }
            Self::DigestSent { md5 } => {
                write!(f, "digest_sent md5={}", md5)
            }
            Self::Complete { bytes_sent, chunks_sent, duration_ms } => {
                write!(f, "complete bytes={} chunks={} duration_ms={}", bytes_sent, chunks_sent, duration_ms)
            }
        }
    }
}

/// Trait for upload logging.
pub trait UploadLogger: Send + Sync {
    fn log(&self, entry: UploadLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl UploadLogger for TracingLogger {
    fn log(&self, entry: UploadLog) {
        // Per-chunk events are debug, problems are warn, lifecycle is info
        match &entry.event {
            UploadEvent::ChunkSent { .. } => {
                tracing::debug!(session_id = entry.session_id, "{}", entry.event);
            }
            UploadEvent::AckTimeout { .. }
            | UploadEvent::DeviceError { .. }
            | UploadEvent::Retry { .. } => {
                tracing::warn!(session_id = entry.session_id, "{}", entry.event);
            }
            _ => {
                tracing::info!(session_id = entry.session_id, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl UploadLogger for NullLogger {
    fn log(&self, _entry: UploadLog) {}
}

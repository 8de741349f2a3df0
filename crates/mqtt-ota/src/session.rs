/// Upload session controller.
///
/// ```text
/// SendHeader -> AwaitHeaderAck -> SendChunk -> AwaitChunkAck --+
///                                    ^                          |
///                                    +---- more data -----------+
///                                    |
///                                    +- EOF -> SendFinal -> AwaitFinalAck -> Done
/// ```
///
/// One request in flight at a time. The header acknowledgment may carry
/// `MaxSize`, which replaces the chunk size for the rest of the session.
/// What happens when an acknowledgment times out or reports an error is
/// decided by `FailurePolicy`.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::ack::{AckOutcome, AckSink, AckTracker};
use crate::error::{ConfigError, Stage, UploadError};
use crate::hasher::ChunkHasher;
use crate::logging::{UploadEvent, UploadLog, UploadLogger};
use crate::progress::*;
use crate::protocol::*;
use crate::transport::Transport;

/// Retries used by `retry` without an explicit count.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What to do when an acknowledgment times out or the device reports an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log and move on to the next step. Nothing is re-sent.
    #[default]
    Continue,
    /// Fail the session.
    Abort,
    /// Publish the same message again, up to `max_retries` times, then fail.
    Retry { max_retries: u32 },
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "continue" => Ok(Self::Continue),
            "abort" => Ok(Self::Abort),
            "retry" => Ok(Self::Retry {
                max_retries: DEFAULT_MAX_RETRIES,
            }),
            _ => match s.strip_prefix("retry:") {
                Some(n) => n
                    .parse()
                    .map(|max_retries| Self::Retry { max_retries })
                    .map_err(|_| format!("invalid retry count: {}", n)),
                None => Err(format!(
                    "unknown failure policy '{}' (expected continue, abort, retry or retry:<n>)",
                    s
                )),
            },
        }
    }
}

/// Configuration for one upload session.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub file_path: PathBuf,
    pub file_type: u32,
    pub session_id: u8,
    pub default_chunk_size: usize,
    pub ack_timeout: Duration,
    pub failure_policy: FailurePolicy,
    /// End an acknowledgment wait as soon as the device reports an error.
    pub error_ends_wait: bool,
}

impl UploadConfig {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            file_type: DEFAULT_FILE_TYPE,
            session_id: DEFAULT_SESSION_ID,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            failure_policy: FailurePolicy::Continue,
            error_ends_wait: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !valid_session_id(self.session_id) {
            return Err(ConfigError::SessionId(self.session_id));
        }
        if self.default_chunk_size == 0 {
            return Err(ConfigError::ChunkSize);
        }
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::AckTimeout);
        }
        Ok(())
    }

    /// Build the acknowledgment channel for this session. The sink goes to the transport.
    pub fn ack_tracker(&self, topics: &Topics) -> (AckTracker, AckSink) {
        let (tracker, sink) = AckTracker::new(self.session_id, &topics.ack, self.ack_timeout);
        (tracker.with_error_ends_wait(self.error_ends_wait), sink)
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub file_size: u64,
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    /// Chunk size in effect after negotiation.
    pub chunk_size: usize,
    pub md5: String,
    pub ack_timeouts: u64,
    pub device_errors: u64,
    pub retries: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SendHeader,
    AwaitHeaderAck,
    SendChunk,
    AwaitChunkAck,
    SendFinal,
    AwaitFinalAck,
    Done,
}

/// Message kept around until acknowledged, for re-sending.
struct Outbound {
    topic: String,
    payload: Vec<u8>,
    stage: Stage,
}

/// Drives one upload over a transport.
pub struct UploadSession<T: Transport> {
    config: UploadConfig,
    topics: Topics,
    transport: T,
    acks: AckTracker,
    progress: Arc<UploadProgress>,
    logger: Option<Arc<dyn UploadLogger>>,
    chunk_size: usize,
    ack_timeouts: u64,
    device_errors: u64,
    retries: u64,
}

impl<T: Transport> UploadSession<T> {
    /// `acks` must come from `config.ack_tracker(&topics)`, with its sink feeding `transport`.
    pub fn new(
        config: UploadConfig,
        topics: Topics,
        transport: T,
        acks: AckTracker,
    ) -> Result<Self, UploadError> {
        config.validate()?;
        let chunk_size = config.default_chunk_size;
        Ok(Self {
            config,
            topics,
            transport,
            acks,
            progress: Arc::new(UploadProgress::new()),
            logger: None,
            chunk_size,
            ack_timeouts: 0,
            device_errors: 0,
            retries: 0,
        })
    }

    pub fn with_logger(mut self, logger: Arc<dyn UploadLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_progress(mut self, progress: Arc<UploadProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> Arc<UploadProgress> {
        self.progress.clone()
    }

    /// Run the whole session. The transport is closed on return.
    pub fn run(mut self) -> Result<UploadReport, UploadError> {
        let result = self.run_states();
        if result.is_err() {
            self.progress.state.store(STATE_ERROR, Ordering::Relaxed);
        }
        let closed = self.transport.close();
        let report = result?;
        closed?;
        Ok(report)
    }

    fn run_states(&mut self) -> Result<UploadReport, UploadError> {
        let start = Instant::now();
        let path = self.config.file_path.clone();
        let file_name = path.to_string_lossy().into_owned();

        let mut file = File::open(&path)
            .map_err(|e| UploadError::io(format!("cannot open {}", path.display()), e))?;
        let file_size = file
            .metadata()
            .map_err(|e| UploadError::io(format!("cannot stat {}", path.display()), e))?
            .len();

        self.progress.bytes_total.store(file_size, Ordering::Relaxed);
        let limit = self.transport.max_payload(&self.topics.chunk);
        if self.chunk_size > limit {
            warn!(
                "Chunk size {} exceeds transport limit, using {}",
                self.chunk_size, limit
            );
            self.chunk_size = limit;
        }
        self.progress
            .chunk_size
            .store(self.chunk_size as u64, Ordering::Relaxed);

        self.transport.subscribe(&self.topics.ack)?;

        let session_id = self.config.session_id;
        let mut hasher = ChunkHasher::new();
        let mut offset: u64 = 0;
        let mut chunks_sent: u64 = 0;
        let mut md5 = String::new();
        let mut in_flight: Option<Outbound> = None;
        let mut state = State::SendHeader;

        while state != State::Done {
            state = match state {
                State::SendHeader => {
                    self.progress.state.store(STATE_HEADER, Ordering::Relaxed);
                    let header = ControlMessage::header(
                        &file_name,
                        session_id,
                        self.config.file_type,
                        file_size,
                    );
                    let out = Outbound {
                        topic: self.topics.control.clone(),
                        payload: header.to_json(),
                        stage: Stage::Header,
                    };
                    self.send(&out)?;
                    in_flight = Some(out);
                    self.log(UploadEvent::Started {
                        file: file_name.clone(),
                        file_size,
                        file_type: self.config.file_type,
                        chunk_size: self.chunk_size,
                    });
                    State::AwaitHeaderAck
                }
                State::AwaitHeaderAck => {
                    if let AckOutcome::Cleared { max_size: Some(max) } =
                        self.await_ack(in_flight.take())?
                    {
                        self.negotiate(max);
                    }
                    self.progress.state.store(STATE_CHUNKS, Ordering::Relaxed);
                    State::SendChunk
                }
                State::SendChunk => {
                    let want = (self.chunk_size as u64).min(file_size - offset);
                    let mut chunk = Vec::with_capacity(want as usize);
                    file.by_ref()
                        .take(want)
                        .read_to_end(&mut chunk)
                        .map_err(|e| UploadError::io(format!("read error at offset {}", offset), e))?;

                    if chunk.is_empty() {
                        if offset != file_size {
                            warn!(
                                "File ended at {} of {} bytes, finishing early",
                                offset, file_size
                            );
                        }
                        State::SendFinal
                    } else {
                        hasher.update(&chunk);
                        let len = chunk.len();
                        let out = Outbound {
                            topic: self.topics.chunk.clone(),
                            payload: chunk,
                            stage: Stage::Chunk { offset },
                        };
                        self.send(&out)?;
                        in_flight = Some(out);

                        self.log(UploadEvent::ChunkSent { offset, len });
                        offset += len as u64;
                        chunks_sent += 1;
                        self.progress.bytes_done.store(offset, Ordering::Relaxed);
                        self.progress.chunks_sent.store(chunks_sent, Ordering::Relaxed);
                        State::AwaitChunkAck
                    }
                }
                State::AwaitChunkAck => {
                    self.await_ack(in_flight.take())?;
                    State::SendChunk
                }
                State::SendFinal => {
                    self.progress.state.store(STATE_FINAL, Ordering::Relaxed);
                    md5 = std::mem::take(&mut hasher).finalize_hex();
                    let out = Outbound {
                        topic: self.topics.control.clone(),
                        payload: ControlMessage::finish(session_id, &md5).to_json(),
                        stage: Stage::Final,
                    };
                    self.send(&out)?;
                    in_flight = Some(out);
                    self.log(UploadEvent::DigestSent { md5: md5.clone() });
                    State::AwaitFinalAck
                }
                State::AwaitFinalAck => {
                    self.await_ack(in_flight.take())?;
                    State::Done
                }
                State::Done => State::Done,
            };
        }

        let elapsed = start.elapsed();
        self.progress.state.store(STATE_COMPLETE, Ordering::Relaxed);
        self.log(UploadEvent::Complete {
            bytes_sent: offset,
            chunks_sent,
            duration_ms: elapsed.as_millis() as u64,
        });

        Ok(UploadReport {
            file_size,
            bytes_sent: offset,
            chunks_sent,
            chunk_size: self.chunk_size,
            md5,
            ack_timeouts: self.ack_timeouts,
            device_errors: self.device_errors,
            retries: self.retries,
            elapsed,
        })
    }

    /// Arm the tracker, then publish.
    fn send(&mut self, out: &Outbound) -> Result<(), UploadError> {
        self.acks.mark_pending();
        self.transport.publish(&out.topic, &out.payload)?;
        Ok(())
    }

    /// Wait for the acknowledgment of `out` and apply the failure policy.
    fn await_ack(&mut self, out: Option<Outbound>) -> Result<AckOutcome, UploadError> {
        let Some(out) = out else {
            return Ok(AckOutcome::TimedOut { device_error: false });
        };

        let mut attempt: u32 = 0;
        loop {
            let outcome = self.acks.wait_for_clear();
            if !outcome.is_pending() {
                return Ok(outcome);
            }
            self.record_failure(outcome, out.stage);

            match self.config.failure_policy {
                FailurePolicy::Continue => return Ok(outcome),
                FailurePolicy::Retry { max_retries } if attempt < max_retries => {
                    attempt += 1;
                    self.retries += 1;
                    self.progress.retries.fetch_add(1, Ordering::Relaxed);
                    self.log(UploadEvent::Retry {
                        stage: out.stage,
                        attempt,
                    });
                    self.send(&out)?;
                }
                FailurePolicy::Abort | FailurePolicy::Retry { .. } => {
                    return Err(if outcome.device_error() {
                        UploadError::DeviceRejected { stage: out.stage }
                    } else {
                        UploadError::AckTimeout { stage: out.stage }
                    });
                }
            }
        }
    }

    fn record_failure(&mut self, outcome: AckOutcome, stage: Stage) {
        if outcome.device_error() {
            self.device_errors += 1;
            self.progress.device_errors.fetch_add(1, Ordering::Relaxed);
            self.log(UploadEvent::DeviceError { stage });
        }
        if let AckOutcome::TimedOut { device_error } = outcome {
            self.ack_timeouts += 1;
            self.progress.ack_timeouts.fetch_add(1, Ordering::Relaxed);
            self.log(UploadEvent::AckTimeout {
                stage,
                device_error,
            });
        }
    }

    fn negotiate(&mut self, max_size: u64) {
        if max_size == 0 {
            warn!("Ignoring MaxSize 0 from device");
            return;
        }
        let limit = self.transport.max_payload(&self.topics.chunk);
        let mut new_size = usize::try_from(max_size).unwrap_or(usize::MAX);
        if new_size > limit {
            warn!(
                "Device MaxSize {} exceeds transport limit, using {}",
                max_size, limit
            );
            new_size = limit;
        }
        if new_size == self.chunk_size {
            return;
        }
        info!("Device set chunk size to {}", new_size);
        self.log(UploadEvent::ChunkSizeNegotiated {
            old_size: self.chunk_size,
            new_size,
        });
        self.chunk_size = new_size;
        self.progress
            .chunk_size
            .store(new_size as u64, Ordering::Relaxed);
    }

    fn log(&self, event: UploadEvent) {
        if let Some(ref logger) = self.logger {
            logger.log(UploadLog {
                session_id: self.config.session_id,
                event,
            });
        }
    }
}

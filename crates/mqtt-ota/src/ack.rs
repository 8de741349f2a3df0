/// Acknowledgment tracking between the receive loop and the control thread.
///
/// ```text
/// [receive loop] --AckSink--> bounded channel --AckTracker--> [session]
///  parse JSON                                   timed receive
///  log device errors                            keyed by session id
/// ```
///
/// At most one request is in flight. `mark_pending` drops whatever is still
/// queued from earlier requests, so a late acknowledgment can never clear the
/// next one.

use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, warn};

use crate::protocol::{ControlMessage, ACK_CHANNEL_CAPACITY};
use crate::transport::InboundHandler;

/// Result of waiting for one acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// A matching acknowledgment arrived before the bound.
    Cleared { max_size: Option<u64> },
    /// The device answered with `Command: Error` and the tracker ends waits on errors.
    Rejected,
    /// The bound elapsed. `device_error` is set if a matching error was seen meanwhile.
    TimedOut { device_error: bool },
}

impl AckOutcome {
    /// True if the request was still pending when the wait returned.
    pub fn is_pending(&self) -> bool {
        !matches!(self, AckOutcome::Cleared { .. })
    }

    pub fn device_error(&self) -> bool {
        matches!(
            self,
            AckOutcome::Rejected | AckOutcome::TimedOut { device_error: true }
        )
    }
}

/// Inbound half: turns acknowledgment payloads into channel messages.
#[derive(Clone)]
pub struct AckSink {
    topic: String,
    tx: Sender<ControlMessage>,
}

impl AckSink {
    /// Parse and forward an acknowledgment payload. Never blocks.
    pub fn dispatch(&self, payload: &[u8]) {
        let Some(msg) = ControlMessage::parse(payload) else {
            debug!(
                "Ignoring non-JSON acknowledgment: {}",
                String::from_utf8_lossy(payload)
            );
            return;
        };

        if msg.is_error() {
            error!("Device reported command error (id={:?})", msg.id);
        }

        self.forward(msg);
    }

    /// Acknowledge request `id` without going through JSON.
    pub fn clear(&self, id: u64) {
        self.forward(ControlMessage {
            id: Some(id),
            ..Default::default()
        });
    }

    fn forward(&self, msg: ControlMessage) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!("Acknowledgment channel full, dropping id={:?}", msg.id);
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Acknowledgment channel closed");
            }
        }
    }
}

impl InboundHandler for AckSink {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        if topic == self.topic {
            self.dispatch(payload);
        } else {
            debug!("Ignoring message on unexpected topic {}", topic);
        }
    }
}

/// Control-thread half: bounded wait for the acknowledgment of the request in flight.
pub struct AckTracker {
    session_id: u8,
    rx: Receiver<ControlMessage>,
    timeout: Duration,
    error_ends_wait: bool,
}

impl AckTracker {
    /// Create a tracker for `session_id` listening on `ack_topic`.
    pub fn new(session_id: u8, ack_topic: &str, timeout: Duration) -> (Self, AckSink) {
        let (tx, rx) = bounded(ACK_CHANNEL_CAPACITY);
        let tracker = Self {
            session_id,
            rx,
            timeout,
            error_ends_wait: false,
        };
        let sink = AckSink {
            topic: ack_topic.to_string(),
            tx,
        };
        (tracker, sink)
    }

    /// Return `Rejected` as soon as a matching error arrives instead of waiting out the bound.
    pub fn with_error_ends_wait(mut self, error_ends_wait: bool) -> Self {
        self.error_ends_wait = error_ends_wait;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm for a new request. Returns the number of stale messages discarded.
    pub fn mark_pending(&self) -> usize {
        let stale = self.rx.try_iter().count();
        if stale > 0 {
            debug!("Discarded {} stale acknowledgment(s)", stale);
        }
        stale
    }

    /// Wait until a matching acknowledgment arrives or the bound elapses.
    pub fn wait_for_clear(&self) -> AckOutcome {
        let deadline = Instant::now() + self.timeout;
        let mut device_error = false;

        loop {
            let msg = match self.rx.recv_deadline(deadline) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Acknowledgment channel disconnected while waiting");
                    break;
                }
            };

            if !msg.is_for(self.session_id) {
                debug!(
                    "Ignoring acknowledgment for id={:?} (session {})",
                    msg.id, self.session_id
                );
                continue;
            }

            if msg.is_error() {
                device_error = true;
                if self.error_ends_wait {
                    return AckOutcome::Rejected;
                }
                continue;
            }

            return AckOutcome::Cleared {
                max_size: msg.max_size,
            };
        }

        AckOutcome::TimedOut { device_error }
    }
}

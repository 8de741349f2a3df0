/// MQTT OTA: firmware upload to a device over publish/subscribe.
///
/// Sends a file to one device in bounded chunks:
/// - JSON header on `cmnd/<topic>/fileupload`, raw chunks on `cmnd/<topic>/fileupload201`
/// - One request in flight, each gated on an acknowledgment from `stat/<topic>/FILEUPLOAD`
/// - Chunk size negotiated from the header acknowledgment's `MaxSize`
/// - MD5 of the sent bytes published at the end for device-side verification
/// - Configurable policy for timeouts and device errors: continue, abort, or retry

pub mod ack;
pub mod error;
pub mod hasher;
pub mod logging;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export key types for convenience.
pub use ack::{AckOutcome, AckSink, AckTracker};
pub use error::{ConfigError, Stage, TransportError, UploadError};
pub use hasher::ChunkHasher;
pub use logging::{NullLogger, TracingLogger, UploadEvent, UploadLog, UploadLogger};
pub use progress::UploadProgress;
pub use protocol::{
    valid_session_id, ControlMessage, Topics, DEFAULT_ACK_TIMEOUT_MS, DEFAULT_CHUNK_SIZE,
    DEFAULT_FILE_TYPE, DEFAULT_SESSION_ID,
};
pub use session::{FailurePolicy, UploadConfig, UploadReport, UploadSession};
pub use transport::{
    max_publish_payload, BrokerConfig, InboundHandler, MqttTransport, Transport, DEFAULT_BROKER_PORT,
};

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Protocol step an acknowledgment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Header,
    Chunk { offset: u64 },
    Final,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header => write!(f, "header"),
            Self::Chunk { offset } => write!(f, "chunk at offset {}", offset),
            Self::Final => write!(f, "final digest"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot connect to broker {addr}: {message}")]
    Connect { addr: String, message: String },

    #[error("no CONNACK from broker {addr} within {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("mqtt client: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("transport already closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("session id {0} must be even and within 2..=254")]
    SessionId(u8),

    #[error("chunk size must be greater than zero")]
    ChunkSize,

    #[error("ack timeout must be greater than zero")]
    AckTimeout,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid upload configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("no acknowledgment for {stage}")]
    AckTimeout { stage: Stage },

    #[error("device rejected {stage}")]
    DeviceRejected { stage: Stage },
}

impl UploadError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

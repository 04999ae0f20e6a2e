use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One decoded frame payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Request(RequestFrame),
    Reply(ReplyFrame),
    Log(LogRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// `None` for fire-and-forget requests, which get no reply.
    pub id: Option<Uuid>,
    pub method: String,
    /// MessagePack-encoded arguments.
    pub arguments: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: Uuid,
    pub outcome: ReplyOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyOutcome {
    /// MessagePack-encoded return value.
    Ok(Bytes),
    /// The handler failed; carries its error message.
    Err(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A log record shipped from a child process to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub name: String,
    pub level: RecordLevel,
    pub message: String,
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

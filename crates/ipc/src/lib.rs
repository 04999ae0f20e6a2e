//! Length-prefixed request/reply transport between the scheduler process and
//! its executor processes.
//!
//! Every frame on the wire is `[u32 big-endian length][MessagePack payload]`.
//! Either side of a [`Connection`] can issue calls and serve methods from its
//! [`MethodRegistry`]; replies are matched to calls by request id.

pub mod connection;
pub mod error;
pub mod frame;
pub mod message;
pub mod registry;

pub use connection::Connection;
pub use error::IpcError;
pub use frame::{encode_frame, FrameBuffer};
pub use message::{Frame, LogRecord, RecordLevel, ReplyFrame, ReplyOutcome, RequestFrame};
pub use registry::MethodRegistry;

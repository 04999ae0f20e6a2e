//! Length-prefix framing.
//!
//! Reads never line up with frames: one read may carry half a frame or
//! several frames back to back. [`FrameBuffer`] accumulates raw bytes and
//! hands out complete payloads one by one.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::IpcError;

/// Size of the big-endian length field preceding each payload.
pub const LENGTH_PREFIX: usize = 4;

pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const INITIAL_CAPACITY: usize = 8 * 1024;

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, IpcError> {
    let len = u32::try_from(payload.len()).map_err(|_| IpcError::FrameTooLarge(payload.len()))?;
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    out.put_u32(len);
    out.put_slice(payload);
    Ok(out.freeze())
}

#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_len: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_frame_len,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The underlying buffer, for reading straight into it.
    pub fn read_target(&mut self) -> &mut BytesMut {
        if self.buf.capacity() - self.buf.len() < INITIAL_CAPACITY {
            self.buf.reserve(INITIAL_CAPACITY);
        }
        &mut self.buf
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete payload, if the buffer holds one.
    ///
    /// A length field above the limit is an error; the buffer is then
    /// unusable since frame boundaries are lost.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, IpcError> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LENGTH_PREFIX];
        len_bytes.copy_from_slice(&self.buf[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > self.max_frame_len {
            return Err(IpcError::FrameTooLarge(len));
        }
        if self.buf.len() < LENGTH_PREFIX + len {
            self.buf.reserve(LENGTH_PREFIX + len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(LENGTH_PREFIX);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Drain every complete payload currently buffered.
    pub fn drain_frames(&mut self) -> Result<Vec<Bytes>, IpcError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

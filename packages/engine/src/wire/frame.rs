// packages/engine/src/wire/frame.rs
//! Stream framing for the kernel's standard streams
//!
//! Messages carry no outer length prefix; [`FrameCodec`] finds boundaries by
//! walking the message structure with [`scan_frame`]. A partial scan yields
//! a lower bound on the message length, and the buffer is not scanned
//! again until it reaches that bound.

use crate::utils::errors::{EngineError, Result};
use crate::wire::decoder::{frame_length, scan_frame, FrameScan};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame accepted from a kernel (512 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

/// Splits a byte stream into complete wire messages
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,

    /// The frame being received is at least this long
    min_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            min_len: 0,
        }
    }

    fn too_large(&self) -> EngineError {
        EngineError::MalformedPayload(format!("frame exceeds {} bytes", self.max_frame_len))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = EngineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.is_empty() || src.len() < self.min_len {
            return Ok(None);
        }
        match scan_frame(src)? {
            FrameScan::Complete(len) => {
                self.min_len = 0;
                Ok(Some(src.split_to(len).freeze()))
            }
            FrameScan::Incomplete { min_len } => {
                if min_len > self.max_frame_len {
                    return Err(self.too_large());
                }
                self.min_len = min_len;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(EngineError::MalformedPayload(format!(
                "stream ended inside a frame ({} bytes buffered)",
                src.len()
            ))),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = EngineError;

    /// Frames are written verbatim once confirmed to be exactly one message
    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<()> {
        match frame_length(&frame)? {
            Some(len) if len == frame.len() => {
                dst.extend_from_slice(&frame);
                Ok(())
            }
            _ => Err(EngineError::MalformedPayload(
                "outgoing buffer is not exactly one message".into(),
            )),
        }
    }
}

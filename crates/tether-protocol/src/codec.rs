//! Length-prefixed MessagePack framing.
//!
//! A frame on the wire is a big-endian `u32` body length followed by the
//! frame serialized as a MessagePack map. One WebSocket message may carry
//! several frames, or only part of one; [`FrameReader`] reassembles them and
//! enforces the receiving side's size limit before buffering a body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Largest frame body accepted when the caller sets no limit of its own (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

/// Errors raised while framing or parsing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The announced or encoded body is larger than the limit in force.
    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    /// A standalone buffer ended before the frame did.
    #[error("Truncated frame: {missing} more bytes expected")]
    Truncated { missing: usize },

    /// A standalone buffer held more than one frame.
    #[error("{0} unexpected bytes after frame")]
    Trailing(usize),

    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Well-formed frame with content the peer should not have sent.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

fn check_size(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max {
        Err(ProtocolError::FrameTooLarge { size, max })
    } else {
        Ok(())
    }
}

/// Body length announced by a prefix, once all four bytes are present.
fn announced_len(buf: &[u8]) -> Option<usize> {
    let prefix: [u8; PREFIX_LEN] = buf.get(..PREFIX_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

/// Encode a frame, serializing straight into the outgoing buffer.
///
/// # Errors
///
/// Fails if serialization fails or the body exceeds [`DEFAULT_MAX_FRAME_SIZE`].
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_u32(0);
    rmp_serde::encode::write_named(&mut (&mut buf).writer(), frame)?;

    let size = buf.len() - PREFIX_LEN;
    check_size(size, DEFAULT_MAX_FRAME_SIZE)?;
    let len = u32::try_from(size).map_err(|_| ProtocolError::FrameTooLarge {
        size,
        max: DEFAULT_MAX_FRAME_SIZE,
    })?;
    buf[..PREFIX_LEN].copy_from_slice(&len.to_be_bytes());

    Ok(buf.freeze())
}

/// Decode a buffer that holds exactly one frame.
///
/// # Errors
///
/// Fails if the buffer is short, carries trailing bytes, or the body is not a frame.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let Some(len) = announced_len(data) else {
        return Err(ProtocolError::Truncated {
            missing: PREFIX_LEN - data.len(),
        });
    };
    check_size(len, DEFAULT_MAX_FRAME_SIZE)?;

    let end = PREFIX_LEN + len;
    match data.len().cmp(&end) {
        std::cmp::Ordering::Less => Err(ProtocolError::Truncated {
            missing: end - data.len(),
        }),
        std::cmp::Ordering::Greater => Err(ProtocolError::Trailing(data.len() - end)),
        std::cmp::Ordering::Equal => Ok(rmp_serde::from_slice(&data[PREFIX_LEN..])?),
    }
}

/// Reassembles frames from a stream of message payloads.
///
/// The reader rejects a frame as soon as its prefix announces a body above
/// `max_frame_size`, so an oversized frame is never buffered in full.
#[derive(Debug)]
pub struct FrameReader {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameReader {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Append one received message.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take the next complete frame, or `None` until more bytes arrive.
    ///
    /// # Errors
    ///
    /// Fails if the next frame is over the limit or does not parse. The
    /// stream cannot be resynchronized afterwards.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let Some(len) = announced_len(&self.buffer) else {
            return Ok(None);
        };
        check_size(len, self.max_frame_size)?;
        if self.buffer.len() < PREFIX_LEN + len {
            self.buffer.reserve(PREFIX_LEN + len - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(PREFIX_LEN);
        let body = self.buffer.split_to(len);
        Ok(Some(rmp_serde::from_slice(&body)?))
    }

    /// Bytes held back for a frame that has not fully arrived.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

//! Wire codec shared by the control socket and the host bridge.
//!
//! Every frame is a little-endian `u32` length followed by that many bytes
//! of UTF-8 JSON:
//!
//! ```text
//! [u32 LE length] [payload: length bytes of JSON]
//! ```
//!
//! A declared length above [`MAX_FRAME_LEN`] is rejected as soon as the
//! header is read, before any payload is buffered. Such an error leaves the
//! stream unsynchronized and callers should drop the connection. A payload
//! that is not valid JSON only yields [`Decoded::Malformed`]; the stream
//! stays usable.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{BrowseError, Result};

/// Maximum frame payload size (10 MiB).
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// One complete frame off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Payload parsed as JSON.
    Message(serde_json::Value),
    /// Payload was framed correctly but is not JSON.
    Malformed(String),
}

/// Encode a message into a single wire frame.
pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(BrowseError::FrameTooLarge {
            declared: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

fn decode_payload(payload: &[u8]) -> Decoded {
    match serde_json::from_slice(payload) {
        Ok(value) => Decoded::Message(value),
        Err(e) => Decoded::Malformed(e.to_string()),
    }
}

fn check_len(declared: usize) -> Result<()> {
    if declared > MAX_FRAME_LEN {
        return Err(BrowseError::FrameTooLarge {
            declared,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

/// Codec for `tokio_util::codec::Framed` over sockets and stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = BrowseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let declared = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        check_len(declared)?;

        let total = HEADER_LEN + declared;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(declared);
        Ok(Some(decode_payload(&payload)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(BrowseError::ConnectionClosed),
        }
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec {
    type Error = BrowseError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        let payload = serde_json::to_vec(&item)?;
        check_len(payload.len())?;
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32_le(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Incremental decoder fed with arbitrary byte chunks.
///
/// Reads the header first and only then takes payload bytes, so an
/// oversize declaration never causes payload to be buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    header: [u8; HEADER_LEN],
    header_len: usize,
    expected: Option<usize>,
    payload: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Incomplete data is kept for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`BrowseError::FrameTooLarge`] when a header declares more
    /// than [`MAX_FRAME_LEN`]; the decoder is reset and the stream should
    /// be abandoned.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Vec<Decoded>> {
        let mut frames = Vec::new();

        while !chunk.is_empty() {
            match self.expected {
                None => {
                    let take = (HEADER_LEN - self.header_len).min(chunk.len());
                    self.header[self.header_len..self.header_len + take]
                        .copy_from_slice(&chunk[..take]);
                    self.header_len += take;
                    chunk = &chunk[take..];

                    if self.header_len < HEADER_LEN {
                        break;
                    }
                    self.header_len = 0;

                    let declared = u32::from_le_bytes(self.header) as usize;
                    if let Err(e) = check_len(declared) {
                        self.reset();
                        return Err(e);
                    }
                    if declared == 0 {
                        frames.push(decode_payload(&[]));
                    } else {
                        self.payload.reserve(declared.min(64 * 1024));
                        self.expected = Some(declared);
                    }
                }
                Some(declared) => {
                    let take = (declared - self.payload.len()).min(chunk.len());
                    self.payload.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if self.payload.len() == declared {
                        frames.push(decode_payload(&self.payload));
                        self.payload.clear();
                        self.expected = None;
                    }
                }
            }
        }

        Ok(frames)
    }

    /// Number of bytes held for an incomplete frame.
    pub fn buffered(&self) -> usize {
        self.header_len + self.payload.len()
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        self.expected.is_some() || self.header_len > 0
    }

    fn reset(&mut self) {
        self.header_len = 0;
        self.expected = None;
        self.payload = Vec::new();
    }
}

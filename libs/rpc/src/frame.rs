//! Connection Framing
//!
//! Minimal framing that lets reactors find call boundaries in a byte stream.
//! Payloads stay opaque. Layout of one frame:
//!
//! ```text
//! +----------------+-----------------+------------------+-----------------+
//! | body len (u32) | header len (u32)| bincode header   | opaque payload  |
//! +----------------+-----------------+------------------+-----------------+
//! ```
//!
//! Both lengths are big-endian; `body len` counts everything after itself.
//! A client writes [`CONNECTION_PREAMBLE`] once before its first frame.

use crate::error::ErrorCode;
use crate::{Result, RpcError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Sent by the connecting side before any frame
pub const CONNECTION_PREAMBLE: &[u8; 4] = b"RPC\x01";

/// Smallest `max_frame_size` the runtime accepts
pub const MIN_FRAME_SIZE: usize = 1024;

const LENGTH_PREFIX: usize = 4;

/// Per-frame header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameHeader {
    Request {
        call_id: u32,
        service: String,
        method: String,
        /// Client deadline hint, 0 when the call has none
        timeout_ms: u64,
    },
    Response {
        call_id: u32,
        error: Option<WireError>,
    },
    Event,
}

/// Failure carried by a response frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

/// One decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

/// Serialize a frame into a single buffer ready for one write
pub fn encode_frame(header: &FrameHeader, payload: &[u8], max_frame_size: usize) -> Result<Bytes> {
    let header_bytes = bincode::serialize(header)?;
    let body_len = LENGTH_PREFIX + header_bytes.len() + payload.len();

    if body_len > max_frame_size {
        return Err(RpcError::protocol(format!(
            "Frame size {} exceeds maximum {}",
            body_len, max_frame_size
        )));
    }

    let mut buffer = BytesMut::with_capacity(LENGTH_PREFIX + body_len);
    buffer.put_u32(body_len as u32);
    buffer.put_u32(header_bytes.len() as u32);
    buffer.extend_from_slice(&header_bytes);
    buffer.extend_from_slice(payload);
    Ok(buffer.freeze())
}

/// Pop the next complete frame off a partially received buffer.
///
/// Returns `Ok(None)` until the whole frame has arrived. Any error means the
/// stream can no longer be trusted and its connection must be closed.
pub fn decode_frame(buffer: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>> {
    if buffer.len() < LENGTH_PREFIX {
        return Ok(None);
    }

    let body_len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if body_len > max_frame_size {
        return Err(RpcError::protocol(format!(
            "Frame size {} exceeds maximum {}",
            body_len, max_frame_size
        )));
    }
    if body_len < LENGTH_PREFIX {
        return Err(RpcError::protocol(format!(
            "Frame size {} too small for a header length",
            body_len
        )));
    }

    let frame_len = LENGTH_PREFIX + body_len;
    if buffer.len() < frame_len {
        buffer.reserve(frame_len - buffer.len());
        return Ok(None);
    }

    buffer.advance(LENGTH_PREFIX);
    let mut body = buffer.split_to(body_len);
    let header_len = body.get_u32() as usize;
    if header_len > body.len() {
        return Err(RpcError::protocol(format!(
            "Header length {} exceeds frame body {}",
            header_len,
            body.len()
        )));
    }

    let header: FrameHeader = bincode::deserialize(&body[..header_len])?;
    body.advance(header_len);

    Ok(Some(Frame {
        header,
        payload: body.freeze(),
    }))
}

/// Consume the connection preamble from the front of `buffer`.
///
/// `Ok(false)` means more bytes are needed.
pub fn consume_preamble(buffer: &mut BytesMut) -> Result<bool> {
    let available = buffer.len().min(CONNECTION_PREAMBLE.len());
    if buffer[..available] != CONNECTION_PREAMBLE[..available] {
        return Err(RpcError::protocol(format!(
            "Bad connection preamble {:?}",
            &buffer[..available]
        )));
    }
    if available < CONNECTION_PREAMBLE.len() {
        return Ok(false);
    }
    buffer.advance(CONNECTION_PREAMBLE.len());
    Ok(true)
}

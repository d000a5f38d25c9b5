use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::kind::FrameKind;

/// Frame header: magic (2) + kind (1) + reserved (1) + length (4) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "AB" (0x41 0x42).
pub const MAGIC: [u8; 2] = [0x41, 0x42];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────┬──────────┬──────────┬────────────┬────────────────┐
/// │ Magic (2B) │ Kind     │ Reserved │ Length     │ Payload        │
/// │ 0x41 0x42  │ (1B)     │ (1B) = 0 │ (4B BE)    │ (Length bytes) │
/// │ "AB"       │          │          │            │                │
/// └────────────┴──────────┴──────────┴────────────┴────────────────┘
/// ```
pub fn encode_frame(kind: FrameKind, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u8(kind.as_u8());
    dst.put_u8(0);
    dst.put_u32(len);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let kind = FrameKind::try_from(src[2])?;
    // src[3] is reserved; ignored on read.
    let payload_len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame { kind, payload }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
